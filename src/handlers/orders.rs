use axum::{
    extract::{Path, Query, State},
    response::Json,
    Extension,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::CancelReason,
    errors::ServiceError,
    handlers::common::PaginationParams,
    services::{
        order_lifecycle::Actor,
        orders::{OrderDetails, OrderPage, OrderSummary},
    },
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct CancelOrderRequest {
    pub reason: CancelReason,
    /// Required when the reason is `other`
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List my orders",
    params(PaginationParams),
    responses(
        (status = 200, description = "Orders, newest first", body = ApiResponse<OrderPage>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<PaginationParams>,
) -> Result<Json<ApiResponse<OrderPage>>, ServiceError> {
    let page = state
        .services
        .orders
        .list_for_customer(user.user_id, params.page, params.per_page)
        .await?;
    Ok(Json(ApiResponse::success(page)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get my order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order with lines, history and payment attempts", body = ApiResponse<OrderDetails>),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let details = state
        .services
        .orders
        .get_for_customer(user.user_id, order_id)
        .await?;
    Ok(Json(ApiResponse::success(details)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/cancel",
    summary = "Cancel my order",
    description = "Allowed while the order is pending or confirmed. Reserved stock is released.",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = CancelOrderRequest,
    responses(
        (status = 200, description = "Order cancelled", body = ApiResponse<OrderSummary>),
        (status = 400, description = "Invalid reason or note", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order can no longer be cancelled", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "orders"
)]
pub async fn cancel_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<CancelOrderRequest>,
) -> Result<Json<ApiResponse<OrderSummary>>, ServiceError> {
    request.validate()?;

    let order = state
        .services
        .lifecycle
        .cancel_order(
            order_id,
            Actor::Customer(user.user_id),
            request.reason,
            request.note,
        )
        .await?;
    Ok(Json(ApiResponse::success_with_message(
        order.into(),
        "Order cancelled",
    )))
}
