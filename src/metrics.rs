//! Prometheus counters for the checkout and settlement paths.
//!
//! Everything is registered in the process-wide default registry and
//! exported in text format by the `/metrics` handler.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref ORDERS_CREATED: IntCounter = register_int_counter!(
        "checkout_orders_created_total",
        "Orders committed by the checkout orchestrator"
    )
    .expect("metric can be created");
    pub static ref CHECKOUT_FAILURES: IntCounterVec = register_int_counter_vec!(
        "checkout_failures_total",
        "Checkouts rolled back, by error code",
        &["reason"]
    )
    .expect("metric can be created");
    pub static ref STOCK_RESERVATION_REJECTIONS: IntCounter = register_int_counter!(
        "stock_reservation_rejections_total",
        "Reservations refused for insufficient stock"
    )
    .expect("metric can be created");
    pub static ref STOCK_UNITS_RELEASED: IntCounter = register_int_counter!(
        "stock_units_released_total",
        "Units returned to availability by cancellations"
    )
    .expect("metric can be created");
    pub static ref PAYMENT_URLS_SIGNED: IntCounter = register_int_counter!(
        "payment_urls_signed_total",
        "Signed gateway redirect URLs issued"
    )
    .expect("metric can be created");
    pub static ref PAYMENT_CALLBACKS: IntCounterVec = register_int_counter_vec!(
        "payment_callbacks_total",
        "Gateway callbacks processed, by outcome",
        &["outcome"]
    )
    .expect("metric can be created");
    pub static ref ORDER_CANCELLATIONS: IntCounter = register_int_counter!(
        "order_cancellations_total",
        "Orders moved to cancelled"
    )
    .expect("metric can be created");
}

pub fn record_checkout_failure(reason: &str) {
    CHECKOUT_FAILURES.with_label_values(&[reason]).inc();
}

pub fn record_callback(outcome: &str) {
    PAYMENT_CALLBACKS.with_label_values(&[outcome]).inc();
}

/// Renders the default registry in Prometheus text exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_text_output() {
        ORDERS_CREATED.inc();
        record_callback("settled");
        record_checkout_failure("EMPTY_CART");

        let text = render().unwrap();
        assert!(text.contains("checkout_orders_created_total"));
        assert!(text.contains("payment_callbacks_total{outcome=\"settled\"}"));
        assert!(text.contains("checkout_failures_total{reason=\"EMPTY_CART\"}"));
    }
}
