use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::HeaderMap,
    response::{Json, Redirect},
    Extension,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::{error, warn};
use url::form_urlencoded::byte_serialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    errors::ServiceError,
    handlers::common::client_ip,
    services::payments::{CallbackOutcome, IpnResponse, PaymentUrlRequest, PaymentUrlResponse},
    ApiResponse, AppState,
};

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct PaymentUrlBody {
    #[validate(length(min = 1, max = 20))]
    pub bank_code: Option<String>,
    #[validate(url)]
    pub return_url: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/payment-url",
    summary = "Create payment URL",
    description = "Signs a fresh gateway redirect for an unpaid order and records a pending payment attempt",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = PaymentUrlBody,
    responses(
        (status = 200, description = "Signed URL", body = ApiResponse<PaymentUrlResponse>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid or cancelled", body = crate::errors::ErrorResponse),
        (status = 502, description = "Gateway not configured", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "payments"
)]
pub async fn create_payment_url(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Option<Json<PaymentUrlBody>>,
) -> Result<Json<ApiResponse<PaymentUrlResponse>>, ServiceError> {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate()?;

    let response = state
        .services
        .payments
        .build_payment_url(PaymentUrlRequest {
            order_id,
            customer_id: Some(user.user_id),
            ip_addr: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
            return_url: body.return_url,
            bank_code: body.bank_code,
        })
        .await?;
    Ok(Json(ApiResponse::success(response)))
}

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Where the customer's browser lands after a callback.
pub fn return_redirect_target(
    frontend_url: &str,
    result: &Result<CallbackOutcome, ServiceError>,
) -> String {
    let base = frontend_url.trim_end_matches('/');
    match result {
        Ok(outcome) if outcome.success => {
            format!("{}/checkout/success?orderId={}", base, outcome.order_id)
        }
        Ok(outcome) => format!(
            "{}/checkout/failure?orderId={}&message={}",
            base,
            outcome.order_id,
            encode(&outcome.message)
        ),
        Err(e) => format!(
            "{}/checkout/failure?message={}",
            base,
            encode(&e.response_message())
        ),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/vnpay/return",
    summary = "Gateway browser return",
    description = "Verifies the signed callback, settles the order and redirects to the storefront",
    responses((status = 303, description = "Redirect to the storefront result page")),
    tag = "payments"
)]
pub async fn vnpay_return(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Redirect {
    let result = state.services.payments.handle_callback(&params).await;
    if let Err(e) = &result {
        warn!(error = %e, "Payment return rejected");
    }
    Redirect::to(&return_redirect_target(&state.config.frontend_url, &result))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/vnpay/ipn",
    summary = "Gateway IPN",
    description = "Server-to-server payment notification",
    responses((status = 200, description = "Acknowledgement", body = IpnResponse)),
    tag = "payments"
)]
pub async fn vnpay_ipn(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Json<IpnResponse> {
    let result = state.services.payments.handle_callback(&params).await;
    match &result {
        Err(ServiceError::SecurityError(_))
        | Err(ServiceError::NotFound(_))
        | Err(ServiceError::ValidationError(_)) => {}
        Err(e) => error!(error = %e, "IPN processing failed"),
        Ok(_) => {}
    }
    Json(IpnResponse::from_result(&result))
}
