//! Atomic order creation.
//!
//! Everything between `begin` and `commit` either lands together or not at
//! all: stock reservations, the order with its lines and first history row,
//! and the cart deletion. Events go out only after the commit.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::entities::{
    cart, cart_item, customer_address, order, order_item, order_status_history,
    FulfillmentStatus, PaymentMethod, PaymentStatus, RefundStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics;
use crate::services::cart_materializer::{compute_totals, materialize_cart, MaterializedCart};
use crate::services::stock_ledger::StockLedger;

#[derive(Debug, Clone)]
pub struct CreateOrderCommand {
    pub customer_id: Uuid,
    pub shipping_address_id: Uuid,
    pub payment_method: PaymentMethod,
    pub shipping_fee: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedOrder {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
}

/// `ORD-{yyyymmdd}-{8 hex}`
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

#[derive(Clone)]
pub struct CheckoutService {
    db_pool: Arc<DatabaseConnection>,
    ledger: Arc<dyn StockLedger>,
    event_sender: Arc<EventSender>,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        ledger: Arc<dyn StockLedger>,
        event_sender: Arc<EventSender>,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            db_pool,
            ledger,
            event_sender,
            currency: currency.into(),
        }
    }

    /// Turns the customer's cart into an unpaid, pending order.
    #[instrument(skip(self), fields(customer_id = %cmd.customer_id))]
    pub async fn create_order(&self, cmd: CreateOrderCommand) -> Result<CreatedOrder, ServiceError> {
        if cmd.shipping_fee < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Shipping fee cannot be negative".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        let created = match self.create_order_in_txn(&txn, &cmd).await {
            Ok(created) => created,
            Err(e) => {
                metrics::record_checkout_failure(e.error_code());
                if let Err(rollback_err) = txn.rollback().await {
                    error!(error = %rollback_err, "Checkout rollback failed");
                }
                return Err(e);
            }
        };
        txn.commit().await?;

        metrics::ORDERS_CREATED.inc();
        info!(
            order_id = %created.order.id,
            order_number = %created.order.order_number,
            total_amount = %created.order.total_amount,
            lines = created.items.len(),
            "Order created"
        );

        self.event_sender
            .send_or_log(Event::OrderCreated {
                order_id: created.order.id,
                customer_id: created.order.customer_id,
                total_amount: created.order.total_amount,
            });

        Ok(created)
    }

    async fn create_order_in_txn(
        &self,
        txn: &DatabaseTransaction,
        cmd: &CreateOrderCommand,
    ) -> Result<CreatedOrder, ServiceError> {
        // Write before the first read. A SQLite reader cannot upgrade while
        // another checkout holds the write lock, so checkouts queue here.
        cart::Entity::update_many()
            .col_expr(cart::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(cart::Column::CustomerId.eq(cmd.customer_id))
            .exec(txn)
            .await?;

        let cart: MaterializedCart = materialize_cart(txn, cmd.customer_id).await?;

        let address = customer_address::Entity::find_by_id(cmd.shipping_address_id)
            .filter(customer_address::Column::CustomerId.eq(cmd.customer_id))
            .one(txn)
            .await?
            .ok_or(ServiceError::AddressNotFound(cmd.shipping_address_id))?;

        for line in &cart.lines {
            self.ledger
                .try_reserve(txn, line.variant_id, line.quantity)
                .await?;
        }

        let totals = compute_totals(&cart.lines, cmd.shipping_fee);
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number(now)),
            customer_id: Set(cmd.customer_id),
            payment_method: Set(cmd.payment_method),
            payment_status: Set(PaymentStatus::Unpaid),
            fulfillment_status: Set(FulfillmentStatus::Pending),
            currency: Set(self.currency.clone()),
            subtotal: Set(totals.subtotal),
            shipping_fee: Set(totals.shipping_fee),
            total_amount: Set(totals.total_amount),
            shipping_name: Set(address.recipient_name.clone()),
            shipping_phone: Set(address.phone.clone()),
            shipping_address: Set(address.formatted()),
            cancel_reason: Set(None),
            cancelled_at: Set(None),
            cancelled_by: Set(None),
            refund_status: Set(None::<RefundStatus>),
            refund_amount: Set(None),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(txn)
        .await?;

        let mut items = Vec::with_capacity(cart.lines.len());
        for line in &cart.lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                variant_id: Set(line.variant_id),
                sku: Set(line.sku.clone()),
                name: Set(line.name.clone()),
                quantity: Set(line.quantity),
                price_at_purchase: Set(line.unit_price),
                line_total: Set(line.unit_price * Decimal::from(line.quantity)),
                created_at: Set(now),
            }
            .insert(txn)
            .await?;
            items.push(item);
        }

        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(FulfillmentStatus::Pending),
            actor_id: Set(Some(cmd.customer_id)),
            note: Set(None),
            created_at: Set(now),
        }
        .insert(txn)
        .await?;

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.is_in(cart.cart_ids.clone()))
            .exec(txn)
            .await?;

        Ok(CreatedOrder { order, items })
    }
}
