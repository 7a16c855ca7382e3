pub mod cart;
pub mod cart_item;
pub mod customer_address;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod product_variant;

pub use order::{
    CancelReason, FulfillmentStatus, PaymentMethod, PaymentStatus, RefundStatus,
};
pub use payment::PaymentAttemptStatus;
