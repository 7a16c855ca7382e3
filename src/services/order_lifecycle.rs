//! Fulfillment state machine.
//!
//! Every transition is a conditional update on the status the caller saw,
//! so two racing requests cannot both apply. Cancellation additionally
//! releases the order's reserved stock in the same transaction; because
//! only one cancel can win the guarded update, the release runs once.

use chrono::{DateTime, Utc};
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, DatabaseTransaction,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::entities::{
    order, order_item, order_status_history, CancelReason, FulfillmentStatus, PaymentMethod,
    PaymentStatus, RefundStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics;
use crate::services::stock_ledger::StockLedger;

const MAX_NOTE_LEN: usize = 500;

/// Who asked for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer(Uuid),
    Admin(Uuid),
    /// Gateway callbacks and scheduled sweeps
    System,
}

impl Actor {
    pub fn id(&self) -> Option<Uuid> {
        match self {
            Actor::Customer(id) | Actor::Admin(id) => Some(*id),
            Actor::System => None,
        }
    }

    /// System transitions never carry free text.
    fn history_note(&self, note: Option<String>) -> Option<String> {
        match self {
            Actor::System => None,
            _ => note.filter(|n| !n.trim().is_empty()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub examined: usize,
    pub cancelled: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct OrderLifecycleService {
    db_pool: Arc<DatabaseConnection>,
    ledger: Arc<dyn StockLedger>,
    event_sender: Arc<EventSender>,
}

impl OrderLifecycleService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        ledger: Arc<dyn StockLedger>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            ledger,
            event_sender,
        }
    }

    /// Takes the write lock on the order row before anything reads it, so
    /// racing transitions queue on SQLite instead of failing to upgrade.
    async fn lock_order(txn: &DatabaseTransaction, order_id: Uuid) -> Result<(), ServiceError> {
        order::Entity::update_many()
            .col_expr(order::Column::UpdatedAt, Expr::col(order::Column::UpdatedAt).into())
            .filter(order::Column::Id.eq(order_id))
            .exec(txn)
            .await?;
        Ok(())
    }

    async fn load_for_actor(
        txn: &DatabaseTransaction,
        order_id: Uuid,
        actor: Actor,
    ) -> Result<order::Model, ServiceError> {
        let order = order::Entity::find_by_id(order_id)
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if let Actor::Customer(customer_id) = actor {
            if order.customer_id != customer_id {
                return Err(ServiceError::NotFound(format!(
                    "Order {} not found",
                    order_id
                )));
            }
        }
        Ok(order)
    }

    async fn append_history(
        txn: &DatabaseTransaction,
        order_id: Uuid,
        status: FulfillmentStatus,
        actor: Actor,
        note: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(status),
            actor_id: Set(actor.id()),
            note: Set(actor.history_note(note)),
            created_at: Set(at),
        }
        .insert(txn)
        .await?;
        Ok(())
    }

    /// Moves an order along the fulfillment table. A target of `cancelled`
    /// goes through [`Self::cancel_order`] so stock is released.
    #[instrument(skip(self, note))]
    pub async fn transition(
        &self,
        order_id: Uuid,
        next: FulfillmentStatus,
        actor: Actor,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        validate_note(note.as_deref())?;

        if next == FulfillmentStatus::Cancelled {
            return self
                .cancel_order(order_id, actor, CancelReason::Other, note)
                .await;
        }
        if matches!(actor, Actor::Customer(_)) {
            return Err(ServiceError::Forbidden(
                "Customers may only cancel orders".to_string(),
            ));
        }

        let txn = self.db_pool.begin().await?;
        Self::lock_order(&txn, order_id).await?;
        let current = Self::load_for_actor(&txn, order_id, actor).await?;
        let from = current.fulfillment_status;

        if !from.can_transition_to(next) {
            return Err(ServiceError::InvalidTransition { from, to: next });
        }

        let now = Utc::now();
        let result = order::Entity::update_many()
            .set(order::ActiveModel {
                fulfillment_status: Set(next),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::FulfillmentStatus.eq(from))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        Self::append_history(&txn, order_id, next, actor, note, now).await?;
        txn.commit().await?;

        info!(%order_id, %from, to = %next, "Order status updated");
        self.emit_status_change(order_id, from, next, actor, now);

        Ok(order::Model {
            fulfillment_status: next,
            updated_at: now,
            ..current
        })
    }

    /// Cancels a pending or confirmed order and hands its reserved units
    /// back to the ledger.
    #[instrument(skip(self, note))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor: Actor,
        reason: CancelReason,
        note: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        validate_note(note.as_deref())?;
        if let Actor::Customer(_) = actor {
            if !reason.customer_selectable() {
                return Err(ServiceError::ValidationError(format!(
                    "Cancel reason {} is not available to customers",
                    reason
                )));
            }
            if reason == CancelReason::Other
                && note.as_deref().map(str::trim).unwrap_or("").is_empty()
            {
                return Err(ServiceError::ValidationError(
                    "A note is required when the cancel reason is other".to_string(),
                ));
            }
        }

        let txn = self.db_pool.begin().await?;
        Self::lock_order(&txn, order_id).await?;
        let current = Self::load_for_actor(&txn, order_id, actor).await?;
        let from = current.fulfillment_status;

        if from == FulfillmentStatus::Cancelled {
            return Err(ServiceError::AlreadyCancelled(order_id));
        }
        if !from.can_transition_to(FulfillmentStatus::Cancelled) {
            return Err(ServiceError::InvalidTransition {
                from,
                to: FulfillmentStatus::Cancelled,
            });
        }

        let (refund_status, refund_amount) = match current.payment_status {
            PaymentStatus::Paid => (RefundStatus::Pending, Some(current.total_amount)),
            PaymentStatus::Unpaid => (RefundStatus::NotApplicable, None),
        };

        let now = Utc::now();
        let result = order::Entity::update_many()
            .set(order::ActiveModel {
                fulfillment_status: Set(FulfillmentStatus::Cancelled),
                cancel_reason: Set(Some(reason)),
                cancelled_at: Set(Some(now)),
                cancelled_by: Set(actor.id()),
                refund_status: Set(Some(refund_status)),
                refund_amount: Set(refund_amount),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::FulfillmentStatus.is_in(FulfillmentStatus::cancellable()))
            .filter(order::Column::PaymentStatus.eq(current.payment_status))
            .exec(&txn)
            .await?;

        if result.rows_affected == 0 {
            // Lost a race; report what the winner did.
            let latest = Self::load_for_actor(&txn, order_id, actor).await?;
            return Err(match latest.fulfillment_status {
                FulfillmentStatus::Cancelled => ServiceError::AlreadyCancelled(order_id),
                status if !status.can_transition_to(FulfillmentStatus::Cancelled) => {
                    ServiceError::InvalidTransition {
                        from: status,
                        to: FulfillmentStatus::Cancelled,
                    }
                }
                _ => ServiceError::ConcurrentModification(order_id),
            });
        }

        let items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        for item in &items {
            self.ledger
                .release(&txn, item.variant_id, item.quantity)
                .await?;
        }

        let history_note = note.or_else(|| Some(reason.to_string()));
        Self::append_history(
            &txn,
            order_id,
            FulfillmentStatus::Cancelled,
            actor,
            history_note,
            now,
        )
        .await?;
        txn.commit().await?;

        metrics::ORDER_CANCELLATIONS.inc();
        info!(
            %order_id,
            %from,
            %reason,
            released_lines = items.len(),
            refund_status = %refund_status,
            "Order cancelled"
        );
        self.emit_status_change(order_id, from, FulfillmentStatus::Cancelled, actor, now);

        Ok(order::Model {
            fulfillment_status: FulfillmentStatus::Cancelled,
            cancel_reason: Some(reason),
            cancelled_at: Some(now),
            cancelled_by: actor.id(),
            refund_status: Some(refund_status),
            refund_amount,
            updated_at: now,
            ..current
        })
    }

    /// Unpaid gateway orders created before `cutoff` that still hold stock.
    /// Cash-on-delivery orders are unpaid by design and never returned.
    #[instrument(skip(self))]
    pub async fn find_stale_unpaid(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<order::Model>, ServiceError> {
        Ok(order::Entity::find()
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .filter(order::Column::PaymentMethod.eq(PaymentMethod::Vnpay))
            .filter(order::Column::FulfillmentStatus.is_in(FulfillmentStatus::cancellable()))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .order_by_asc(order::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    /// One pass of the external expiry job: cancels every stale unpaid
    /// order as the system with reason `payment_expired`.
    #[instrument(skip(self))]
    pub async fn sweep_stale_unpaid(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<SweepReport, ServiceError> {
        let stale = self.find_stale_unpaid(cutoff).await?;
        let mut report = SweepReport {
            examined: stale.len(),
            ..Default::default()
        };

        for order in stale {
            match self
                .cancel_order(order.id, Actor::System, CancelReason::PaymentExpired, None)
                .await
            {
                Ok(_) => report.cancelled += 1,
                Err(
                    e @ (ServiceError::AlreadyCancelled(_)
                    | ServiceError::InvalidTransition { .. }
                    | ServiceError::ConcurrentModification(_)),
                ) => {
                    warn!(order_id = %order.id, error = %e, "Skipping stale order");
                    report.skipped += 1;
                }
                Err(e) => {
                    error!(order_id = %order.id, error = %e, "Stale order sweep aborted");
                    return Err(e);
                }
            }
        }

        info!(
            examined = report.examined,
            cancelled = report.cancelled,
            skipped = report.skipped,
            "Stale order sweep finished"
        );
        Ok(report)
    }

    pub async fn history(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<order_status_history::Model>, ServiceError> {
        Ok(order_status_history::Entity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?)
    }

    fn emit_status_change(
        &self,
        order_id: Uuid,
        old_status: FulfillmentStatus,
        new_status: FulfillmentStatus,
        actor: Actor,
        at: DateTime<Utc>,
    ) {
        self.event_sender.send_or_log(Event::OrderStatusChanged {
            order_id,
            old_status,
            new_status,
            actor_id: actor.id(),
            at,
        });
    }
}

fn validate_note(note: Option<&str>) -> Result<(), ServiceError> {
    match note {
        Some(n) if n.chars().count() > MAX_NOTE_LEN => Err(ServiceError::ValidationError(
            format!("Note must be at most {} characters", MAX_NOTE_LEN),
        )),
        _ => Ok(()),
    }
}
