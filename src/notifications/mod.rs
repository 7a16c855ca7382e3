//! Outbound status-change notifications.
//!
//! Delivery happens off the request path, from the event loop. A failed
//! notification never affects the order it describes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::NotifierConfig;
use crate::entities::FulfillmentStatus;
use crate::errors::ServiceError;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub order_id: Uuid,
    pub old_status: FulfillmentStatus,
    pub new_status: FulfillmentStatus,
    pub actor_id: Option<Uuid>,
    pub changed_at: DateTime<Utc>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusNotifier: Send + Sync {
    async fn notify(&self, change: &StatusChange) -> Result<(), ServiceError>;
}

/// Default notifier: writes the change to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl StatusNotifier for LogNotifier {
    async fn notify(&self, change: &StatusChange) -> Result<(), ServiceError> {
        info!(
            order_id = %change.order_id,
            old_status = %change.old_status,
            new_status = %change.new_status,
            "Order status changed"
        );
        Ok(())
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign_payload(secret: &str, timestamp: &str, body: &str) -> Result<String, ServiceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ServiceError::InternalError(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// POSTs each change as JSON, retrying with exponential backoff.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
    max_retries: u32,
    backoff_base: Duration,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        secret: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            secret,
            max_retries: max_retries.max(1),
            backoff_base: Duration::from_secs(1),
        })
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }
}

#[async_trait]
impl StatusNotifier for WebhookNotifier {
    #[instrument(skip(self, change), fields(order_id = %change.order_id))]
    async fn notify(&self, change: &StatusChange) -> Result<(), ServiceError> {
        let body = serde_json::to_string(change)?;
        let timestamp = Utc::now().timestamp().to_string();
        let signature = match &self.secret {
            Some(secret) => Some(sign_payload(secret, &timestamp, &body)?),
            None => None,
        };

        for attempt in 1..=self.max_retries {
            let mut request = self
                .client
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header(TIMESTAMP_HEADER, &timestamp)
                .body(body.clone());
            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    info!(attempt, "Status webhook delivered");
                    return Ok(());
                }
                Ok(response) => warn!(
                    status = %response.status(),
                    attempt,
                    max = self.max_retries,
                    "Status webhook rejected"
                ),
                Err(e) => warn!(error = %e, attempt, max = self.max_retries, "Status webhook error"),
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff_base * 2_u32.pow(attempt - 1)).await;
            }
        }

        Err(ServiceError::ExternalServiceError(format!(
            "Status webhook failed after {} attempts",
            self.max_retries
        )))
    }
}

/// Webhook when a URL is configured, log otherwise.
pub fn notifier_from_config(
    cfg: &NotifierConfig,
) -> Result<std::sync::Arc<dyn StatusNotifier>, ServiceError> {
    Ok(match &cfg.webhook_url {
        Some(url) => std::sync::Arc::new(WebhookNotifier::new(
            url.clone(),
            cfg.webhook_secret.clone(),
            cfg.max_retries,
            Duration::from_secs(cfg.timeout_secs),
        )?),
        None => std::sync::Arc::new(LogNotifier),
    })
}
