//! Read side for orders: customer listing, details, admin lookup.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{
    order, order_item, order_status_history, payment, CancelReason, FulfillmentStatus,
    PaymentAttemptStatus, PaymentMethod, PaymentStatus, RefundStatus,
};
use crate::errors::ServiceError;

const MAX_PER_PAGE: u64 = 100;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderSummary {
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub currency: String,
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub total_amount: Decimal,
    pub shipping_name: String,
    pub shipping_phone: String,
    pub shipping_address: String,
    pub cancel_reason: Option<CancelReason>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub refund_status: Option<RefundStatus>,
    pub refund_amount: Option<Decimal>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<order::Model> for OrderSummary {
    fn from(m: order::Model) -> Self {
        Self {
            id: m.id,
            order_number: m.order_number,
            customer_id: m.customer_id,
            payment_method: m.payment_method,
            payment_status: m.payment_status,
            fulfillment_status: m.fulfillment_status,
            currency: m.currency,
            subtotal: m.subtotal,
            shipping_fee: m.shipping_fee,
            total_amount: m.total_amount,
            shipping_name: m.shipping_name,
            shipping_phone: m.shipping_phone,
            shipping_address: m.shipping_address,
            cancel_reason: m.cancel_reason,
            cancelled_at: m.cancelled_at,
            refund_status: m.refund_status,
            refund_amount: m.refund_amount,
            paid_at: m.paid_at,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderLineView {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub price_at_purchase: Decimal,
    pub line_total: Decimal,
}

impl From<order_item::Model> for OrderLineView {
    fn from(m: order_item::Model) -> Self {
        Self {
            id: m.id,
            variant_id: m.variant_id,
            sku: m.sku,
            name: m.name,
            quantity: m.quantity,
            price_at_purchase: m.price_at_purchase,
            line_total: m.line_total,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StatusHistoryView {
    pub status: FulfillmentStatus,
    pub actor_id: Option<Uuid>,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<order_status_history::Model> for StatusHistoryView {
    fn from(m: order_status_history::Model) -> Self {
        Self {
            status: m.status,
            actor_id: m.actor_id,
            note: m.note,
            created_at: m.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentView {
    pub id: Uuid,
    pub transaction_ref: String,
    pub gateway_transaction_no: Option<String>,
    pub amount: Decimal,
    pub provider: String,
    pub bank_code: Option<String>,
    pub status: PaymentAttemptStatus,
    pub response_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<payment::Model> for PaymentView {
    fn from(m: payment::Model) -> Self {
        Self {
            id: m.id,
            transaction_ref: m.transaction_ref,
            gateway_transaction_no: m.gateway_transaction_no,
            amount: m.amount,
            provider: m.provider,
            bank_code: m.bank_code,
            status: m.status,
            response_code: m.response_code,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderDetails {
    pub order: OrderSummary,
    pub items: Vec<OrderLineView>,
    pub history: Vec<StatusHistoryView>,
    pub payments: Vec<PaymentView>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct OrderPage {
    pub items: Vec<OrderSummary>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
    pub total_pages: u64,
}

#[derive(Clone)]
pub struct OrderQueryService {
    db_pool: Arc<DatabaseConnection>,
}

impl OrderQueryService {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    /// Newest first. `page` is 1-based.
    #[instrument(skip(self))]
    pub async fn list_for_customer(
        &self,
        customer_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderPage, ServiceError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);

        let paginator = order::Entity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db_pool, per_page);
        let totals = paginator.num_items_and_pages().await?;
        let items = paginator.fetch_page(page - 1).await?;

        Ok(OrderPage {
            items: items.into_iter().map(OrderSummary::from).collect(),
            total: totals.number_of_items,
            page,
            per_page,
            total_pages: totals.number_of_pages,
        })
    }

    /// Details for the owner only; someone else's order reads as missing.
    #[instrument(skip(self))]
    pub async fn get_for_customer(
        &self,
        customer_id: Uuid,
        order_id: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .filter(order::Column::CustomerId.eq(customer_id))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.details(order).await
    }

    #[instrument(skip(self))]
    pub async fn get_details(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        self.details(order).await
    }

    async fn details(&self, order: order::Model) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;
        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order.id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(db)
            .await?;
        let history = order_status_history::Entity::find()
            .filter(order_status_history::Column::OrderId.eq(order.id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(db)
            .await?;
        let payments = payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .order_by_asc(payment::Column::CreatedAt)
            .all(db)
            .await?;

        Ok(OrderDetails {
            order: order.into(),
            items: items.into_iter().map(Into::into).collect(),
            history: history.into_iter().map(Into::into).collect(),
            payments: payments.into_iter().map(Into::into).collect(),
        })
    }
}
