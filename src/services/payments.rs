//! Gateway hand-off and settlement.
//!
//! `build_payment_url` records a pending attempt and returns the signed
//! redirect. `handle_callback` verifies a gateway callback and settles the
//! order with a conditional update, so replays are harmless.

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{
    order, payment, FulfillmentStatus, PaymentAttemptStatus, PaymentMethod, PaymentStatus,
    RefundStatus,
};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::metrics;
use crate::services::payment_signer::{gateway_amount, PaymentRequest, PaymentSigner};

const PARAM_TXN_REF: &str = "vnp_TxnRef";
const PARAM_AMOUNT: &str = "vnp_Amount";
const PARAM_RESPONSE_CODE: &str = "vnp_ResponseCode";
const PARAM_TRANSACTION_STATUS: &str = "vnp_TransactionStatus";
const PARAM_TRANSACTION_NO: &str = "vnp_TransactionNo";

#[derive(Debug, Clone)]
pub struct PaymentUrlRequest {
    pub order_id: Uuid,
    /// Owner check; `None` skips it
    pub customer_id: Option<Uuid>,
    pub ip_addr: String,
    pub return_url: Option<String>,
    pub bank_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PaymentUrlResponse {
    pub order_id: Uuid,
    pub payment_id: Uuid,
    pub transaction_ref: String,
    pub payment_url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    /// This callback moved the order to paid
    Settled,
    /// The order was already paid; nothing changed
    AlreadySettled,
    /// Gateway reported a failure; order stays unpaid
    Declined,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CallbackOutcome {
    pub success: bool,
    pub order_id: Uuid,
    pub message: String,
    pub status: CallbackStatus,
}

/// Customer-facing text for common gateway response codes.
pub fn describe_response_code(code: &str) -> &'static str {
    match code {
        "00" => "Payment successful",
        "07" => "Payment deducted but flagged as suspicious",
        "09" => "Card or account is not registered for internet banking",
        "10" => "Card or account verification failed too many times",
        "11" => "Payment window expired",
        "12" => "Card or account is locked",
        "13" => "Incorrect one-time password",
        "24" => "Payment cancelled by customer",
        "51" => "Insufficient account balance",
        "65" => "Daily transaction limit exceeded",
        "75" => "Issuing bank is under maintenance",
        "79" => "Payment password entered incorrectly too many times",
        _ => "Payment failed",
    }
}

#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DatabaseConnection>,
    signer: Arc<PaymentSigner>,
    event_sender: Arc<EventSender>,
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DatabaseConnection>,
        signer: Arc<PaymentSigner>,
        event_sender: Arc<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            signer,
            event_sender,
        }
    }

    pub fn signer(&self) -> &PaymentSigner {
        &self.signer
    }

    /// Signs a redirect for an unpaid gateway order and records the attempt.
    #[instrument(skip(self, req), fields(order_id = %req.order_id))]
    pub async fn build_payment_url(
        &self,
        req: PaymentUrlRequest,
    ) -> Result<PaymentUrlResponse, ServiceError> {
        let db = &*self.db_pool;
        let order = order::Entity::find_by_id(req.order_id)
            .one(db)
            .await?
            .filter(|o| req.customer_id.map_or(true, |c| o.customer_id == c))
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", req.order_id)))?;

        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::AlreadyPaid(order.id));
        }
        if order.payment_method != PaymentMethod::Vnpay {
            return Err(ServiceError::ValidationError(format!(
                "Order {} is not paid through the payment gateway",
                order.id
            )));
        }
        if order.fulfillment_status == FulfillmentStatus::Cancelled {
            return Err(ServiceError::Conflict(format!(
                "Order {} is cancelled",
                order.id
            )));
        }
        if let Some(return_url) = &req.return_url {
            url::Url::parse(return_url).map_err(|e| {
                ServiceError::ValidationError(format!("Invalid return URL: {}", e))
            })?;
        }

        let now = Utc::now();
        let txn_ref = format!("{}_{}", order.id.simple(), now.timestamp_millis());
        let signed = self.signer.build_url(&PaymentRequest {
            order_number: order.order_number.clone(),
            amount: order.total_amount,
            ip_addr: req.ip_addr.clone(),
            txn_ref: txn_ref.clone(),
            return_url: req.return_url.clone(),
            bank_code: req.bank_code.clone(),
            created_at: now,
        })?;

        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            transaction_ref: Set(txn_ref.clone()),
            gateway_transaction_no: Set(None),
            amount: Set(order.total_amount),
            provider: Set(self.signer.config().provider.clone()),
            method: Set(PaymentMethod::Vnpay.to_string()),
            bank_code: Set(req.bank_code.clone()),
            status: Set(PaymentAttemptStatus::Pending),
            response_code: Set(None),
            response_data: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await?;

        metrics::PAYMENT_URLS_SIGNED.inc();
        info!(order_id = %order.id, %txn_ref, "Payment URL issued");

        Ok(PaymentUrlResponse {
            order_id: order.id,
            payment_id: payment.id,
            transaction_ref: txn_ref,
            payment_url: signed.url,
            expires_at: signed.expires_at,
        })
    }

    /// Verifies and applies a gateway callback. Safe to call any number of
    /// times for the same callback.
    #[instrument(skip(self, params))]
    pub async fn handle_callback(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<CallbackOutcome, ServiceError> {
        if let Err(e) = self.signer.verify(params) {
            metrics::record_callback("invalid_signature");
            return Err(e);
        }

        let txn_ref = params
            .get(PARAM_TXN_REF)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ServiceError::NotFound("Callback carries no vnp_TxnRef".to_string())
            })?;

        let db = &*self.db_pool;
        let attempt = payment::Entity::find()
            .filter(payment::Column::TransactionRef.eq(txn_ref.as_str()))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", txn_ref)))?;
        let order = order::Entity::find_by_id(attempt.order_id)
            .one(db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Order {} not found", attempt.order_id))
            })?;

        let expected = gateway_amount(attempt.amount, self.signer.config().amount_multiplier)?;
        let reported = params
            .get(PARAM_AMOUNT)
            .and_then(|a| a.parse::<i64>().ok());
        if reported != Some(expected) {
            warn!(%txn_ref, expected, ?reported, "Callback amount mismatch");
            metrics::record_callback("amount_mismatch");
            return Err(ServiceError::ValidationError(format!(
                "Amount mismatch for {}",
                txn_ref
            )));
        }

        if order.payment_status == PaymentStatus::Paid {
            metrics::record_callback("already_settled");
            return Ok(already_settled(order.id));
        }

        let success_code = self.signer.config().success_response_code.as_str();
        let response_code = params
            .get(PARAM_RESPONSE_CODE)
            .cloned()
            .unwrap_or_default();
        let approved = response_code == success_code
            && params
                .get(PARAM_TRANSACTION_STATUS)
                .map_or(true, |s| s == success_code);
        let gateway_no = params.get(PARAM_TRANSACTION_NO).cloned();
        let response_data = serde_json::to_value(params)?;
        let now = Utc::now();

        if !approved {
            let updated = payment::Entity::update_many()
                .set(payment::ActiveModel {
                    status: Set(PaymentAttemptStatus::Failed),
                    response_code: Set(Some(response_code.clone())),
                    gateway_transaction_no: Set(gateway_no),
                    response_data: Set(Some(response_data)),
                    updated_at: Set(now),
                    ..Default::default()
                })
                .filter(payment::Column::Id.eq(attempt.id))
                .filter(payment::Column::Status.eq(PaymentAttemptStatus::Pending))
                .exec(db)
                .await?;

            metrics::record_callback("declined");
            info!(order_id = %order.id, %txn_ref, %response_code, "Payment declined");
            if updated.rows_affected > 0 {
                self.event_sender
                    .send_or_log(Event::PaymentDeclined {
                        order_id: order.id,
                        transaction_ref: txn_ref.clone(),
                        response_code: response_code.clone(),
                    });
            }
            return Ok(CallbackOutcome {
                success: false,
                order_id: order.id,
                message: describe_response_code(&response_code).to_string(),
                status: CallbackStatus::Declined,
            });
        }

        let txn = self.db_pool.begin().await?;
        let settled = order::Entity::update_many()
            .set(order::ActiveModel {
                payment_status: Set(PaymentStatus::Paid),
                paid_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .exec(&txn)
            .await?;

        if settled.rows_affected == 0 {
            // A concurrent delivery of the same callback got there first.
            txn.rollback().await?;
            metrics::record_callback("already_settled");
            return Ok(already_settled(order.id));
        }

        payment::Entity::update_many()
            .set(payment::ActiveModel {
                status: Set(PaymentAttemptStatus::Success),
                response_code: Set(Some(response_code.clone())),
                gateway_transaction_no: Set(gateway_no),
                response_data: Set(Some(response_data)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(payment::Column::Id.eq(attempt.id))
            .filter(payment::Column::Status.eq(PaymentAttemptStatus::Pending))
            .exec(&txn)
            .await?;

        // Money arrived for an order that was cancelled meanwhile.
        let refund = order::Entity::update_many()
            .set(order::ActiveModel {
                refund_status: Set(Some(RefundStatus::Pending)),
                refund_amount: Set(Some(order.total_amount)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::FulfillmentStatus.eq(FulfillmentStatus::Cancelled))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        metrics::record_callback("settled");
        info!(
            order_id = %order.id,
            %txn_ref,
            amount = %attempt.amount,
            refund_flagged = refund.rows_affected > 0,
            "Payment settled"
        );
        self.event_sender
            .send_or_log(Event::PaymentSettled {
                order_id: order.id,
                transaction_ref: txn_ref.clone(),
                amount: attempt.amount,
            });

        Ok(CallbackOutcome {
            success: true,
            order_id: order.id,
            message: describe_response_code(&response_code).to_string(),
            status: CallbackStatus::Settled,
        })
    }
}

fn already_settled(order_id: Uuid) -> CallbackOutcome {
    CallbackOutcome {
        success: true,
        order_id,
        message: "Order already paid".to_string(),
        status: CallbackStatus::AlreadySettled,
    }
}

/// `{RspCode, Message}` answer for the server-to-server notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct IpnResponse {
    #[serde(rename = "RspCode")]
    pub rsp_code: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl IpnResponse {
    fn new(code: &str, message: &str) -> Self {
        Self {
            rsp_code: code.to_string(),
            message: message.to_string(),
        }
    }

    pub fn from_result(result: &Result<CallbackOutcome, ServiceError>) -> Self {
        match result {
            Ok(outcome) if outcome.status == CallbackStatus::AlreadySettled => {
                Self::new("02", "Order already confirmed")
            }
            Ok(_) => Self::new("00", "Confirm success"),
            Err(ServiceError::SecurityError(_)) => Self::new("97", "Invalid signature"),
            Err(ServiceError::NotFound(_)) => Self::new("01", "Order not found"),
            Err(ServiceError::ValidationError(_)) => Self::new("04", "Invalid amount"),
            Err(_) => Self::new("99", "Unknown error"),
        }
    }
}
