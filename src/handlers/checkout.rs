use axum::{
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    Extension,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::warn;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::PaymentMethod,
    errors::ServiceError,
    handlers::common::client_ip,
    services::{
        cart_materializer::MaterializedCart,
        checkout::CreateOrderCommand,
        orders::{OrderLineView, OrderSummary},
        payments::PaymentUrlRequest,
    },
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CheckoutRequest {
    pub shipping_address_id: Uuid,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub shipping_fee: Decimal,
    /// Preselects a bank on the gateway page
    #[validate(length(min = 1, max = 20))]
    pub bank_code: Option<String>,
    /// Overrides the configured gateway return URL
    #[validate(url)]
    pub return_url: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub order: OrderSummary,
    pub items: Vec<OrderLineView>,
    /// Present for gateway orders when the redirect could be signed
    pub payment_url: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/checkout/preview",
    summary = "Preview checkout",
    description = "Current prices, availability and subtotal for the caller's cart",
    responses(
        (status = 200, description = "Cart materialized", body = ApiResponse<MaterializedCart>),
        (status = 400, description = "Cart is empty or invalid", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "checkout"
)]
pub async fn preview_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<ApiResponse<MaterializedCart>>, ServiceError> {
    let cart = state.services.cart.preview(user.user_id).await?;
    Ok(Json(ApiResponse::success(cart)))
}

#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    summary = "Place order",
    description = "Reserves stock, creates the order and clears the cart in one transaction. Gateway orders also receive a signed payment URL.",
    request_body = CheckoutRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Empty cart, unknown address or invalid input", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "checkout"
)]
pub async fn create_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    request.validate()?;

    let created = state
        .services
        .checkout
        .create_order(CreateOrderCommand {
            customer_id: user.user_id,
            shipping_address_id: request.shipping_address_id,
            payment_method: request.payment_method,
            shipping_fee: request.shipping_fee,
        })
        .await?;

    // The order is committed; a signing failure only means the client
    // asks for the URL again.
    let payment_url = if created.order.payment_method == PaymentMethod::Vnpay {
        match state
            .services
            .payments
            .build_payment_url(PaymentUrlRequest {
                order_id: created.order.id,
                customer_id: Some(user.user_id),
                ip_addr: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
                return_url: request.return_url,
                bank_code: request.bank_code,
            })
            .await
        {
            Ok(url) => Some(url.payment_url),
            Err(e) => {
                warn!(order_id = %created.order.id, error = %e, "Could not build payment URL after checkout");
                None
            }
        }
    } else {
        None
    };

    let response = CheckoutResponse {
        order: created.order.into(),
        items: created.items.into_iter().map(Into::into).collect(),
        payment_url,
    };
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}
