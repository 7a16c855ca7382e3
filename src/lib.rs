//! Storefront checkout library
//!
//! Cart to order conversion with stock reservation, signed payment gateway
//! hand-off, callback settlement and the order fulfillment lifecycle.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod middleware_helpers;
pub mod migrator;
pub mod notifications;
pub mod openapi;
pub mod services;
pub mod tracing;

use axum::{
    middleware::{from_fn, from_fn_with_state},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use http::HeaderValue;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::ToSchema;

use crate::auth::JwtVerifier;
use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub event_sender: Arc<EventSender>,
    pub services: handlers::AppServices,
    pub jwt: Arc<JwtVerifier>,
}

impl AppState {
    pub fn new(db: Arc<DbPool>, config: AppConfig, event_sender: Arc<EventSender>) -> Self {
        let services = handlers::AppServices::new(db.clone(), event_sender.clone(), &config);
        Self::with_services(db, config, event_sender, services)
    }

    pub fn with_services(
        db: Arc<DbPool>,
        config: AppConfig,
        event_sender: Arc<EventSender>,
        services: handlers::AppServices,
    ) -> Self {
        let jwt = Arc::new(JwtVerifier::from_config(&config));
        Self {
            db,
            config: Arc::new(config),
            event_sender,
            services,
            jwt,
        }
    }
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success(data)
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

/// Versioned API. Customer routes need a valid bearer token, admin routes
/// additionally the admin role; gateway callbacks are signature checked.
pub fn api_v1_routes(jwt: Arc<JwtVerifier>) -> Router<AppState> {
    let customer = Router::new()
        .route("/checkout/preview", get(handlers::checkout::preview_checkout))
        .route("/checkout", post(handlers::checkout::create_order))
        .route("/orders", get(handlers::orders::list_orders))
        .route("/orders/:id", get(handlers::orders::get_order))
        .route("/orders/:id/cancel", post(handlers::orders::cancel_order))
        .route(
            "/orders/:id/payment-url",
            post(handlers::payments::create_payment_url),
        )
        .route_layer(from_fn_with_state(jwt.clone(), auth::auth_middleware));

    let admin = Router::new()
        .route("/admin/orders/:id", get(handlers::admin::get_order))
        .route(
            "/admin/orders/:id/status",
            put(handlers::admin::update_order_status),
        )
        .route_layer(from_fn(auth::require_admin))
        .route_layer(from_fn_with_state(jwt, auth::auth_middleware));

    let gateway = Router::new()
        .route("/payments/vnpay/return", get(handlers::payments::vnpay_return))
        .route("/payments/vnpay/ipn", get(handlers::payments::vnpay_ipn));

    Router::new().merge(customer).merge(admin).merge(gateway)
}

/// Full application router without CORS or compression.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::health::metrics_handler))
        .nest("/api/v1", api_v1_routes(state.jwt.clone()))
        .merge(openapi::swagger_ui())
        .layer(crate::tracing::configure_http_tracing())
        // Ensure every request carries a request id for traceability
        .layer(from_fn(
            middleware_helpers::request_id::request_id_middleware,
        ))
        .with_state(state)
}

/// Builds the CORS layer from configuration. Production deployments must
/// name their origins or opt into permissive CORS explicitly.
pub fn cors_layer(cfg: &AppConfig) -> Result<CorsLayer, errors::ServiceError> {
    let configured_origins: Option<Vec<HeaderValue>> = cfg
        .cors_allowed_origins
        .as_ref()
        .map(|raw| {
            raw.split(',')
                .filter_map(|origin| {
                    let trimmed = origin.trim();
                    if trimmed.is_empty() {
                        None
                    } else {
                        HeaderValue::from_str(trimmed).ok()
                    }
                })
                .collect::<Vec<_>>()
        })
        .filter(|origins| !origins.is_empty());

    if let Some(origins) = configured_origins {
        Ok(CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any))
    } else if cfg.should_allow_permissive_cors() {
        ::tracing::info!(
            "Using permissive CORS because explicit origins were not configured ({})",
            if cfg.is_development() {
                "development environment"
            } else {
                "explicit override enabled"
            }
        );
        Ok(CorsLayer::permissive())
    } else {
        Err(errors::ServiceError::InternalError(
            "Missing CORS configuration: set APP__CORS_ALLOWED_ORIGINS or APP__CORS_ALLOW_ANY_ORIGIN=true"
                .to_string(),
        ))
    }
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-123"), async {
                ApiResponse::success("ok")
            })
            .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn message_response_keeps_metadata() {
        let response =
            crate::tracing::scope_request_id(crate::tracing::RequestId::new("meta-msg"), async {
                ApiResponse::success_with_message(1, "Order cancelled")
            })
            .await;

        assert_eq!(response.message.as_deref(), Some("Order cancelled"));
        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-msg"));
    }

    #[test]
    fn cors_requires_explicit_choice_outside_development() {
        let mut cfg = AppConfig::new(
            "sqlite::memory:".into(),
            "x".repeat(32),
            "production".into(),
        );
        assert!(cors_layer(&cfg).is_err());

        cfg.cors_allowed_origins = Some("https://shop.example.com, ".into());
        assert!(cors_layer(&cfg).is_ok());

        cfg.cors_allowed_origins = None;
        cfg.environment = "development".into();
        assert!(cors_layer(&cfg).is_ok());
    }
}
