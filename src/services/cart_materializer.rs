//! Resolves a customer's cart into priced lines at current catalog prices.
//!
//! Read-only: nothing here touches stock counters or cart rows. Checkout
//! calls it on its own transaction; the preview endpoint calls it on the pool.

use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{cart, cart_item, product_variant};
use crate::errors::ServiceError;

/// A cart line snapshot with the price it would be bought at right now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MaterializedLine {
    pub cart_item_id: Uuid,
    pub variant_id: Uuid,
    pub sku: String,
    pub name: String,
    pub quantity: i32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    /// Units available at read time; informational only
    pub available: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MaterializedCart {
    pub customer_id: Uuid,
    pub cart_ids: Vec<Uuid>,
    pub lines: Vec<MaterializedLine>,
    pub subtotal: Decimal,
}

impl MaterializedCart {
    /// Lines whose requested quantity exceeds what is currently available.
    pub fn short_lines(&self) -> impl Iterator<Item = &MaterializedLine> {
        self.lines.iter().filter(|l| l.quantity > l.available)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub shipping_fee: Decimal,
    pub total_amount: Decimal,
}

/// `total = Σ(quantity × unit_price) + shipping_fee`
pub fn compute_totals(lines: &[MaterializedLine], shipping_fee: Decimal) -> OrderTotals {
    let subtotal: Decimal = lines
        .iter()
        .map(|l| l.unit_price * Decimal::from(l.quantity))
        .sum();
    OrderTotals {
        subtotal,
        shipping_fee,
        total_amount: subtotal + shipping_fee,
    }
}

/// Loads every line of the customer's carts and prices it.
///
/// Fails with `EmptyCart` when there are no lines, and with a
/// `ValidationError` for a non-positive quantity or a variant that no
/// longer exists.
pub async fn materialize_cart<C: ConnectionTrait>(
    conn: &C,
    customer_id: Uuid,
) -> Result<MaterializedCart, ServiceError> {
    let cart_ids: Vec<Uuid> = cart::Entity::find()
        .filter(cart::Column::CustomerId.eq(customer_id))
        .all(conn)
        .await?
        .into_iter()
        .map(|c| c.id)
        .collect();

    if cart_ids.is_empty() {
        return Err(ServiceError::EmptyCart);
    }

    let rows = cart_item::Entity::find()
        .filter(cart_item::Column::CartId.is_in(cart_ids.clone()))
        .order_by_asc(cart_item::Column::CreatedAt)
        .find_also_related(product_variant::Entity)
        .all(conn)
        .await?;

    if rows.is_empty() {
        return Err(ServiceError::EmptyCart);
    }

    let mut lines = Vec::with_capacity(rows.len());
    for (item, variant) in rows {
        if item.quantity <= 0 {
            return Err(ServiceError::ValidationError(format!(
                "Cart item {} has invalid quantity {}",
                item.id, item.quantity
            )));
        }
        let variant = variant.ok_or_else(|| {
            ServiceError::ValidationError(format!(
                "Product variant {} in cart no longer exists",
                item.variant_id
            ))
        })?;

        lines.push(MaterializedLine {
            cart_item_id: item.id,
            variant_id: variant.id,
            sku: variant.sku.clone(),
            name: variant.name.clone(),
            quantity: item.quantity,
            unit_price: variant.price,
            line_total: variant.price * Decimal::from(item.quantity),
            available: variant.available(),
        });
    }

    let subtotal = lines.iter().map(|l| l.line_total).sum();

    Ok(MaterializedCart {
        customer_id,
        cart_ids,
        lines,
        subtotal,
    })
}

/// Pool-backed wrapper used by the checkout preview endpoint.
#[derive(Clone)]
pub struct CartMaterializer {
    db_pool: Arc<DatabaseConnection>,
}

impl CartMaterializer {
    pub fn new(db_pool: Arc<DatabaseConnection>) -> Self {
        Self { db_pool }
    }

    #[instrument(skip(self))]
    pub async fn preview(&self, customer_id: Uuid) -> Result<MaterializedCart, ServiceError> {
        materialize_cart(&*self.db_pool, customer_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn line(quantity: i32, unit_price: Decimal) -> MaterializedLine {
        MaterializedLine {
            cart_item_id: Uuid::new_v4(),
            variant_id: Uuid::new_v4(),
            sku: "SKU".into(),
            name: "Item".into(),
            quantity,
            unit_price,
            line_total: unit_price * Decimal::from(quantity),
            available: 10,
        }
    }

    #[test]
    fn totals_add_shipping_to_subtotal() {
        let lines = vec![line(2, dec!(100000)), line(1, dec!(50000)), line(3, dec!(10.50))];
        let totals = compute_totals(&lines, dec!(30000));
        assert_eq!(totals.subtotal, dec!(250031.50));
        assert_eq!(totals.total_amount, dec!(280031.50));
    }

    #[test]
    fn short_lines_reports_oversized_quantities() {
        let mut big = line(12, dec!(1));
        big.available = 3;
        let cart = MaterializedCart {
            customer_id: Uuid::nil(),
            cart_ids: vec![],
            lines: vec![line(1, dec!(1)), big.clone()],
            subtotal: dec!(13),
        };
        let short: Vec<_> = cart.short_lines().collect();
        assert_eq!(short, vec![&big]);
    }

    proptest! {
        #[test]
        fn total_equals_sum_of_lines_plus_shipping(
            items in prop::collection::vec((1i32..50, 0i64..10_000_000), 1..8),
            shipping in 0i64..1_000_000,
        ) {
            let lines: Vec<_> = items
                .iter()
                .map(|(q, cents)| line(*q, Decimal::new(*cents, 2)))
                .collect();
            let shipping_fee = Decimal::new(shipping, 2);
            let totals = compute_totals(&lines, shipping_fee);

            let expected: Decimal = lines
                .iter()
                .map(|l| Decimal::from(l.quantity) * l.unit_price)
                .sum::<Decimal>()
                + shipping_fee;
            prop_assert_eq!(totals.total_amount, expected);
            prop_assert_eq!(totals.total_amount - totals.subtotal, shipping_fee);
        }
    }
}
