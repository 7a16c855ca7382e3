//! Per-variant stock counters.
//!
//! Availability is `total_stock - reserved_stock`. Reservations are a single
//! conditional `UPDATE`, so the check and the increment happen in one
//! statement and two concurrent checkouts can never both see the same
//! remaining units.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, QueryFilter,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::product_variant::{self, Entity as ProductVariant};
use crate::errors::ServiceError;
use crate::metrics;

/// Atomic reserve/release over variant stock. Both operations run on the
/// caller's transaction so they commit or roll back with the order.
#[async_trait]
pub trait StockLedger: Send + Sync {
    /// Increments `reserved_stock` by `qty` only if enough stock is available.
    async fn try_reserve(
        &self,
        txn: &DatabaseTransaction,
        variant_id: Uuid,
        qty: i32,
    ) -> Result<(), ServiceError>;

    /// Returns `qty` units to availability. Never fails on a short counter;
    /// an underflow is logged and skipped.
    async fn release(
        &self,
        txn: &DatabaseTransaction,
        variant_id: Uuid,
        qty: i32,
    ) -> Result<(), ServiceError>;
}

#[derive(Debug, Clone, Default)]
pub struct SqlStockLedger;

impl SqlStockLedger {
    pub fn new() -> Self {
        Self
    }
}

/// Current available quantity for a variant.
pub async fn available<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
) -> Result<Option<i32>, ServiceError> {
    Ok(ProductVariant::find_by_id(variant_id)
        .one(conn)
        .await?
        .map(|v| v.available()))
}

#[async_trait]
impl StockLedger for SqlStockLedger {
    #[instrument(skip(self, txn))]
    async fn try_reserve(
        &self,
        txn: &DatabaseTransaction,
        variant_id: Uuid,
        qty: i32,
    ) -> Result<(), ServiceError> {
        if qty <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Reservation quantity must be positive, got {}",
                qty
            )));
        }

        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::ReservedStock,
                Expr::col(product_variant::Column::ReservedStock).add(qty),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product_variant::Column::Id.eq(variant_id))
            .filter(
                Expr::col(product_variant::Column::TotalStock)
                    .gte(Expr::col(product_variant::Column::ReservedStock).add(qty)),
            )
            .exec(txn)
            .await?;

        if result.rows_affected == 1 {
            debug!(%variant_id, qty, "Reserved stock");
            return Ok(());
        }

        // Nothing matched: either the variant is gone or there is not enough
        // stock. The row is already write-locked by this transaction.
        match available(txn, variant_id).await? {
            None => Err(ServiceError::ValidationError(format!(
                "Product variant {} no longer exists",
                variant_id
            ))),
            Some(available) => {
                metrics::STOCK_RESERVATION_REJECTIONS.inc();
                warn!(%variant_id, requested = qty, available, "Insufficient stock");
                Err(ServiceError::InsufficientStock {
                    variant_id,
                    requested: qty,
                    available: available.max(0),
                })
            }
        }
    }

    #[instrument(skip(self, txn))]
    async fn release(
        &self,
        txn: &DatabaseTransaction,
        variant_id: Uuid,
        qty: i32,
    ) -> Result<(), ServiceError> {
        if qty <= 0 {
            return Ok(());
        }

        let result = ProductVariant::update_many()
            .col_expr(
                product_variant::Column::ReservedStock,
                Expr::col(product_variant::Column::ReservedStock).sub(qty),
            )
            .col_expr(product_variant::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(product_variant::Column::Id.eq(variant_id))
            .filter(product_variant::Column::ReservedStock.gte(qty))
            .exec(txn)
            .await?;

        if result.rows_affected == 0 {
            warn!(
                %variant_id,
                qty,
                "Release skipped: variant missing or reserved stock lower than quantity"
            );
        } else {
            metrics::STOCK_UNITS_RELEASED.inc_by(qty as u64);
            debug!(%variant_id, qty, "Released stock");
        }

        Ok(())
    }
}
