use utoipa::{
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "Bearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront Checkout API",
        version = "0.1.0",
        description = r#"
# Storefront Checkout API

Turns a customer's cart into an order, hands gateway payments off with a
signed redirect URL and settles orders from the gateway's signed callbacks.

## Authentication

Customer and admin endpoints take a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

Gateway callbacks (`/api/v1/payments/vnpay/*`) are authenticated by their
HMAC-SHA512 signature instead.

## Errors

Failures share one body shape with a stable `code`:

```json
{
  "error": "Unprocessable Entity",
  "code": "INSUFFICIENT_STOCK",
  "message": "Insufficient stock for variant ...",
  "request_id": "req-abc123",
  "timestamp": "2024-01-01T00:00:00Z"
}
```
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "checkout", description = "Cart preview and order placement"),
        (name = "orders", description = "Customer order history and cancellation"),
        (name = "payments", description = "Gateway hand-off and callbacks"),
        (name = "admin", description = "Fulfillment management"),
        (name = "health", description = "Health and metrics")
    ),
    paths(
        crate::handlers::checkout::preview_checkout,
        crate::handlers::checkout::create_order,

        crate::handlers::orders::list_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::cancel_order,

        crate::handlers::payments::create_payment_url,
        crate::handlers::payments::vnpay_return,
        crate::handlers::payments::vnpay_ipn,

        crate::handlers::admin::get_order,
        crate::handlers::admin::update_order_status,

        crate::handlers::health::health_check,
        crate::handlers::health::metrics_handler,
    ),
    components(
        schemas(
            crate::handlers::checkout::CheckoutRequest,
            crate::handlers::checkout::CheckoutResponse,
            crate::handlers::orders::CancelOrderRequest,
            crate::handlers::payments::PaymentUrlBody,
            crate::handlers::admin::UpdateStatusRequest,
            crate::services::payments::IpnResponse,
            crate::errors::ErrorResponse
        )
    ),
    modifiers(&BearerAuth)
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_generation() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Storefront Checkout API"));
        assert!(json.contains("/api/v1/checkout"));
        assert!(json.contains("/api/v1/payments/vnpay/ipn"));
        assert!(json.contains("\"Bearer\""));
    }
}
