#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::Value;
use storefront_checkout::{
    auth::{Claims, ADMIN_ROLE},
    config::AppConfig,
    db::{self, DbConfig, DbPool},
    entities::{cart, cart_item, customer_address, order, product_variant, PaymentMethod},
    events::{Event, EventSender},
    handlers::AppServices,
    services::{
        checkout::{CreateOrderCommand, CreatedOrder},
        payment_signer::{canonical_query, gateway_amount, sign, SECURE_HASH},
        stock_ledger::{SqlStockLedger, StockLedger},
    },
    AppState,
};
use tempfile::TempDir;
use tokio::sync::{mpsc, Mutex};
use tower::ServiceExt;
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret_key_for_testing_purposes_only_32chars";
pub const HASH_SECRET: &str = "TESTSECRETKEY0123456789";
pub const TMN_CODE: &str = "TESTTMN1";

pub fn test_config(database_url: String, pool_size: u32) -> AppConfig {
    let mut cfg = AppConfig::new(database_url, JWT_SECRET.to_string(), "test".to_string());
    cfg.db_max_connections = pool_size;
    cfg.db_min_connections = 1;
    cfg.frontend_url = "https://shop.example.com".to_string();
    cfg.payment.tmn_code = TMN_CODE.to_string();
    cfg.payment.hash_secret = HASH_SECRET.to_string();
    cfg
}

/// File-backed SQLite application with migrations applied. One pooled
/// connection unless a test asks for more.
pub struct TestApp {
    pub state: AppState,
    pub db: Arc<DbPool>,
    pub customer_id: Uuid,
    pub admin_id: Uuid,
    router: Router,
    events: Mutex<mpsc::Receiver<Event>>,
    _dir: TempDir,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::build(1, None).await
    }

    pub async fn with_pool_size(pool_size: u32) -> Self {
        Self::build(pool_size, None).await
    }

    pub async fn with_ledger(ledger: Arc<dyn StockLedger>) -> Self {
        Self::build(1, Some(ledger)).await
    }

    async fn build(pool_size: u32, ledger: Option<Arc<dyn StockLedger>>) -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("checkout.db").display());
        let cfg = test_config(url, pool_size);

        let mut db_cfg = DbConfig::from(&cfg);
        db_cfg.sqlx_logging = false;
        let pool = db::establish_connection_with_config(&db_cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(256);
        let event_sender = Arc::new(EventSender::new(event_tx));
        let ledger = ledger.unwrap_or_else(|| Arc::new(SqlStockLedger::new()));
        let services =
            AppServices::with_ledger(db.clone(), event_sender.clone(), &cfg, ledger);
        let state = AppState::with_services(db.clone(), cfg, event_sender, services);
        let router = storefront_checkout::app_router(state.clone());

        Self {
            state,
            db,
            customer_id: Uuid::new_v4(),
            admin_id: Uuid::new_v4(),
            router,
            events: Mutex::new(event_rx),
            _dir: dir,
        }
    }

    pub fn services(&self) -> &AppServices {
        &self.state.services
    }

    /// Events emitted so far, oldest first.
    pub async fn drain_events(&self) -> Vec<Event> {
        let mut rx = self.events.lock().await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn seed_variant(&self, sku: &str, price: i64, total_stock: i32) -> product_variant::Model {
        let now = Utc::now();
        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(Uuid::new_v4()),
            sku: Set(sku.to_string()),
            name: Set(format!("Variant {}", sku)),
            price: Set(Decimal::from(price)),
            total_stock: Set(total_stock),
            reserved_stock: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed product variant")
    }

    pub async fn seed_address(&self, customer_id: Uuid) -> customer_address::Model {
        let now = Utc::now();
        customer_address::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            recipient_name: Set("Nguyen Van A".to_string()),
            phone: Set("0901234567".to_string()),
            address_line_1: Set("12 Le Loi".to_string()),
            address_line_2: Set(None),
            city: Set("Ho Chi Minh City".to_string()),
            province: Set(None),
            postal_code: Set(Some("700000".to_string())),
            country_code: Set("VN".to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed address")
    }

    /// Fresh cart for `customer_id` holding the given `(variant, qty)` lines.
    pub async fn seed_cart(&self, customer_id: Uuid, lines: &[(Uuid, i32)]) -> cart::Model {
        let now = Utc::now();
        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(Some(customer_id)),
            session_id: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed cart");

        for (variant_id, quantity) in lines {
            cart_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                cart_id: Set(cart.id),
                variant_id: Set(*variant_id),
                quantity: Set(*quantity),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&*self.db)
            .await
            .expect("seed cart item");
        }
        cart
    }

    /// Seeds a cart and address for the default customer and checks out.
    pub async fn place_order(
        &self,
        lines: &[(Uuid, i32)],
        payment_method: PaymentMethod,
    ) -> CreatedOrder {
        self.seed_cart(self.customer_id, lines).await;
        let address = self.seed_address(self.customer_id).await;
        self.services()
            .checkout
            .create_order(CreateOrderCommand {
                customer_id: self.customer_id,
                shipping_address_id: address.id,
                payment_method,
                shipping_fee: Decimal::ZERO,
            })
            .await
            .expect("checkout should succeed")
    }

    pub async fn variant(&self, id: Uuid) -> product_variant::Model {
        product_variant::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("load variant")
            .expect("variant exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.db)
            .await
            .expect("load order")
            .expect("order exists")
    }

    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            exp: now + 3600,
            iat: now,
            iss: None,
            aud: None,
            email: None,
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(JWT_SECRET.as_bytes()),
        )
        .expect("encode access token")
    }

    pub fn customer_token(&self) -> String {
        self.token_for(self.customer_id, &[])
    }

    pub fn admin_token(&self) -> String {
        self.token_for(self.admin_id, &[ADMIN_ROLE])
    }

    /// Send a request against the router with an optional bearer token.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        token: Option<&str>,
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);

        if let Some(tok) = token {
            builder = builder.header("authorization", format!("Bearer {}", tok));
        }

        let body = if let Some(json) = body {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&json).expect("failed to serialize json request body"))
        } else {
            Body::empty()
        };

        let request = builder.body(body).expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}

/// Gateway callback parameters for `txn_ref`, signed with the test secret.
pub fn signed_callback(txn_ref: &str, amount: Decimal, response_code: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("vnp_TmnCode".to_string(), TMN_CODE.to_string());
    params.insert("vnp_TxnRef".to_string(), txn_ref.to_string());
    params.insert(
        "vnp_Amount".to_string(),
        gateway_amount(amount, 100).expect("amount fits").to_string(),
    );
    params.insert("vnp_ResponseCode".to_string(), response_code.to_string());
    params.insert("vnp_TransactionStatus".to_string(), response_code.to_string());
    params.insert("vnp_TransactionNo".to_string(), "14226112".to_string());
    params.insert("vnp_BankCode".to_string(), "NCB".to_string());
    params.insert("vnp_OrderInfo".to_string(), format!("Payment for {}", txn_ref));
    params.insert("vnp_PayDate".to_string(), "20240301103000".to_string());
    resign(&mut params);
    params
}

/// Recomputes `vnp_SecureHash` after a test edits the parameters.
pub fn resign(params: &mut BTreeMap<String, String>) {
    params.remove(SECURE_HASH);
    let canonical = canonical_query(params, Default::default());
    params.insert(
        SECURE_HASH.to_string(),
        sign(HASH_SECRET, &canonical).expect("sign callback"),
    );
}
