use axum::{
    extract::{Path, State},
    response::Json,
    Extension,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthUser,
    entities::FulfillmentStatus,
    errors::ServiceError,
    services::{
        order_lifecycle::Actor,
        orders::{OrderDetails, OrderSummary},
    },
    ApiResponse, AppState,
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub status: FulfillmentStatus,
    #[validate(length(max = 500))]
    pub note: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/admin/orders/{id}",
    summary = "Get any order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order details", body = ApiResponse<OrderDetails>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderDetails>>, ServiceError> {
    let details = state.services.orders.get_details(order_id).await?;
    Ok(Json(ApiResponse::success(details)))
}

#[utoipa::path(
    put,
    path = "/api/v1/admin/orders/{id}/status",
    summary = "Update fulfillment status",
    description = "Moves the order one step along pending, confirmed, processing, shipping, delivered. Cancelling releases reserved stock.",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderSummary>),
        (status = 403, description = "Admin role required", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Transition not allowed", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = [])),
    tag = "admin"
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<OrderSummary>>, ServiceError> {
    request.validate()?;

    let order = state
        .services
        .lifecycle
        .transition(
            order_id,
            request.status,
            Actor::Admin(user.user_id),
            request.note,
        )
        .await?;
    Ok(Json(ApiResponse::success(order.into())))
}
