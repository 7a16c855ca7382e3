use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::entities::FulfillmentStatus;
use crate::notifications::{StatusChange, StatusNotifier};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends after a commit without waiting for channel capacity. A full or
    /// closed channel drops the event with a log line; the state change it
    /// describes is already durable.
    pub fn send_or_log(&self, event: Event) {
        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(?event, "Event channel full, dropping domain event");
            }
            Err(TrySendError::Closed(event)) => {
                error!(?event, "Event channel closed, dropping domain event");
            }
        }
    }
}

/// Domain events emitted after a transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        customer_id: Uuid,
        total_amount: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: FulfillmentStatus,
        new_status: FulfillmentStatus,
        actor_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
    PaymentSettled {
        order_id: Uuid,
        transaction_ref: String,
        amount: Decimal,
    },
    PaymentDeclined {
        order_id: Uuid,
        transaction_ref: String,
        response_code: String,
    },
}

/// Drains the channel until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, notifier: Arc<dyn StatusNotifier>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        debug!(?event, "Received event");

        match event {
            Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status,
                actor_id,
                at,
            } => {
                let change = StatusChange {
                    order_id,
                    old_status,
                    new_status,
                    actor_id,
                    changed_at: at,
                };
                if let Err(e) = notifier.notify(&change).await {
                    error!(
                        %order_id,
                        error = %e,
                        "Failed to deliver status change notification"
                    );
                }
            }
            Event::OrderCreated {
                order_id,
                customer_id,
                total_amount,
            } => {
                info!(%order_id, %customer_id, %total_amount, "Order created");
            }
            Event::PaymentSettled {
                order_id,
                transaction_ref,
                amount,
            } => {
                info!(%order_id, %transaction_ref, %amount, "Payment settled");
            }
            Event::PaymentDeclined {
                order_id,
                transaction_ref,
                response_code,
            } => {
                info!(%order_id, %transaction_ref, %response_code, "Payment declined");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ServiceError;
    use crate::notifications::MockStatusNotifier;

    #[tokio::test]
    async fn status_changes_reach_the_notifier_and_failures_are_swallowed() {
        let order_id = Uuid::new_v4();
        let mut notifier = MockStatusNotifier::new();
        notifier
            .expect_notify()
            .withf(move |c| c.order_id == order_id && c.new_status == FulfillmentStatus::Cancelled)
            .times(2)
            .returning(|_| Err(ServiceError::ExternalServiceError("down".into())));

        let (tx, rx) = mpsc::channel(8);
        let sender = EventSender::new(tx);
        for _ in 0..2 {
            sender
                .send(Event::OrderStatusChanged {
                    order_id,
                    old_status: FulfillmentStatus::Pending,
                    new_status: FulfillmentStatus::Cancelled,
                    actor_id: None,
                    at: Utc::now(),
                })
                .await
                .unwrap();
        }
        sender
            .send(Event::OrderCreated {
                order_id,
                customer_id: Uuid::new_v4(),
                total_amount: Decimal::ONE,
            })
            .await
            .unwrap();
        drop(sender);

        process_events(rx, Arc::new(notifier)).await;
    }

    fn declined(response_code: &str) -> Event {
        Event::PaymentDeclined {
            order_id: Uuid::nil(),
            transaction_ref: "x".into(),
            response_code: response_code.into(),
        }
    }

    #[test]
    fn send_or_log_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        EventSender::new(tx).send_or_log(declined("24"));
    }

    #[tokio::test]
    async fn send_or_log_never_waits_on_a_full_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);

        sender.send_or_log(declined("24"));
        // Nothing drains the channel; this one is dropped instead of blocking.
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            sender.send_or_log(declined("51"))
        })
        .await
        .expect("send_or_log blocked on a full channel");

        assert_eq!(rx.recv().await, Some(declined("24")));
        assert!(rx.try_recv().is_err());
    }
}
