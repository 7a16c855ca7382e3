use std::sync::Arc;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    services::{
        cart_materializer::CartMaterializer,
        checkout::CheckoutService,
        order_lifecycle::OrderLifecycleService,
        orders::OrderQueryService,
        payment_signer::PaymentSigner,
        payments::PaymentService,
        stock_ledger::{SqlStockLedger, StockLedger},
    },
};

pub mod admin;
pub mod checkout;
pub mod common;
pub mod health;
pub mod orders;
pub mod payments;

/// Service container shared by every handler.
#[derive(Clone)]
pub struct AppServices {
    pub cart: Arc<CartMaterializer>,
    pub checkout: Arc<CheckoutService>,
    pub payments: Arc<PaymentService>,
    pub lifecycle: Arc<OrderLifecycleService>,
    pub orders: Arc<OrderQueryService>,
}

impl AppServices {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Arc<EventSender>, config: &AppConfig) -> Self {
        Self::with_ledger(db_pool, event_sender, config, Arc::new(SqlStockLedger::new()))
    }

    /// Same wiring with a caller supplied stock ledger.
    pub fn with_ledger(
        db_pool: Arc<DbPool>,
        event_sender: Arc<EventSender>,
        config: &AppConfig,
        ledger: Arc<dyn StockLedger>,
    ) -> Self {
        let signer = Arc::new(PaymentSigner::new(config.payment.clone()));

        Self {
            cart: Arc::new(CartMaterializer::new(db_pool.clone())),
            checkout: Arc::new(CheckoutService::new(
                db_pool.clone(),
                ledger.clone(),
                event_sender.clone(),
                config.payment.currency.clone(),
            )),
            payments: Arc::new(PaymentService::new(
                db_pool.clone(),
                signer,
                event_sender.clone(),
            )),
            lifecycle: Arc::new(OrderLifecycleService::new(
                db_pool.clone(),
                ledger,
                event_sender,
            )),
            orders: Arc::new(OrderQueryService::new(db_pool)),
        }
    }
}
