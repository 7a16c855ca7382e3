use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;

/// Order header. `payment_status` and `fulfillment_status` are independent
/// axes; `total_amount` is fixed at creation.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(unique)]
    pub order_number: String,
    pub customer_id: Uuid,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub fulfillment_status: FulfillmentStatus,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub subtotal: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub shipping_fee: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_amount: Decimal,
    pub shipping_name: String,
    pub shipping_phone: String,
    pub shipping_address: String,
    #[sea_orm(nullable)]
    pub cancel_reason: Option<CancelReason>,
    #[sea_orm(nullable)]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[sea_orm(nullable)]
    pub cancelled_by: Option<Uuid>,
    #[sea_orm(nullable)]
    pub refund_status: Option<RefundStatus>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub refund_amount: Option<Decimal>,
    #[sea_orm(nullable)]
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::order_status_history::Entity")]
    StatusHistory,
    #[sea_orm(has_many = "super::payment::Entity")]
    Payments,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

impl Related<super::payment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Payments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "unpaid")]
    Unpaid,
    #[sea_orm(string_value = "paid")]
    Paid,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FulfillmentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "confirmed")]
    Confirmed,
    #[sea_orm(string_value = "processing")]
    Processing,
    #[sea_orm(string_value = "shipping")]
    Shipping,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl FulfillmentStatus {
    /// The complete transition table. Anything not listed here is rejected.
    pub fn can_transition_to(self, next: FulfillmentStatus) -> bool {
        use FulfillmentStatus::*;

        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Confirmed, Processing)
                | (Processing, Shipping)
                | (Shipping, Delivered)
                | (Pending, Cancelled)
                | (Confirmed, Cancelled)
        )
    }

    /// States from which cancellation (and its stock release) is allowed.
    pub fn cancellable() -> [FulfillmentStatus; 2] {
        [FulfillmentStatus::Pending, FulfillmentStatus::Confirmed]
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FulfillmentStatus::Delivered | FulfillmentStatus::Cancelled
        )
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    /// Cash on delivery, settled outside the gateway
    #[sea_orm(string_value = "cod")]
    Cod,
    #[sea_orm(string_value = "vnpay")]
    Vnpay,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RefundStatus {
    #[sea_orm(string_value = "not_applicable")]
    NotApplicable,
    #[sea_orm(string_value = "pending")]
    Pending,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    Display,
    EnumString,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(30))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CancelReason {
    #[sea_orm(string_value = "changed_mind")]
    ChangedMind,
    #[sea_orm(string_value = "ordered_wrong_item")]
    OrderedWrongItem,
    #[sea_orm(string_value = "wrong_size_color")]
    WrongSizeColor,
    #[sea_orm(string_value = "found_better_price")]
    FoundBetterPrice,
    #[sea_orm(string_value = "delivery_too_slow")]
    DeliveryTooSlow,
    #[sea_orm(string_value = "payment_issue")]
    PaymentIssue,
    #[sea_orm(string_value = "duplicate_order")]
    DuplicateOrder,
    #[sea_orm(string_value = "other")]
    Other,
    /// Only used by the stale unpaid order sweep
    #[sea_orm(string_value = "payment_expired")]
    PaymentExpired,
}

impl CancelReason {
    pub fn customer_selectable(self) -> bool {
        !matches!(self, CancelReason::PaymentExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use sea_orm::Iterable;
    use std::str::FromStr;
    use FulfillmentStatus::*;

    #[rstest]
    #[case(Pending, Confirmed)]
    #[case(Confirmed, Processing)]
    #[case(Processing, Shipping)]
    #[case(Shipping, Delivered)]
    #[case(Pending, Cancelled)]
    #[case(Confirmed, Cancelled)]
    fn allowed_transitions(#[case] from: FulfillmentStatus, #[case] to: FulfillmentStatus) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case(Processing, Cancelled)]
    #[case(Shipping, Cancelled)]
    #[case(Delivered, Cancelled)]
    #[case(Cancelled, Cancelled)]
    #[case(Cancelled, Pending)]
    #[case(Delivered, Shipping)]
    #[case(Pending, Shipping)]
    #[case(Confirmed, Pending)]
    fn rejected_transitions(#[case] from: FulfillmentStatus, #[case] to: FulfillmentStatus) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for from in FulfillmentStatus::iter().filter(|s| s.is_terminal()) {
            for to in FulfillmentStatus::iter() {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn string_forms_match_storage_values() {
        assert_eq!(FulfillmentStatus::Shipping.to_string(), "shipping");
        assert_eq!(
            CancelReason::from_str("wrong_size_color").unwrap(),
            CancelReason::WrongSizeColor
        );
        assert_eq!(
            serde_json::to_value(PaymentStatus::Unpaid).unwrap(),
            serde_json::json!("unpaid")
        );
    }
}
