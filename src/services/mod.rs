// Stock and cart
pub mod cart_materializer;
pub mod stock_ledger;

// Order creation and lifecycle
pub mod checkout;
pub mod order_lifecycle;
pub mod orders;

// Payment gateway
pub mod payment_signer;
pub mod payments;
