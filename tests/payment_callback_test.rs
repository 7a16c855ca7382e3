mod common;

use assert_matches::assert_matches;
use common::{resign, signed_callback, TestApp};
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use storefront_checkout::{
    entities::{
        payment, CancelReason, FulfillmentStatus, PaymentAttemptStatus, PaymentMethod,
        PaymentStatus, RefundStatus,
    },
    errors::ServiceError,
    events::Event,
    services::{
        order_lifecycle::Actor,
        payment_signer::SECURE_HASH,
        payments::{CallbackStatus, IpnResponse, PaymentUrlRequest, PaymentUrlResponse},
    },
};
use url::Url;
use uuid::Uuid;

async fn gateway_order(app: &TestApp) -> (Uuid, PaymentUrlResponse) {
    let v = app.seed_variant("SKU-PAY", 150_000, 10).await;
    let created = app.place_order(&[(v.id, 2)], PaymentMethod::Vnpay).await;
    let url = app
        .services()
        .payments
        .build_payment_url(PaymentUrlRequest {
            order_id: created.order.id,
            customer_id: Some(app.customer_id),
            ip_addr: "203.0.113.9".to_string(),
            return_url: None,
            bank_code: Some("NCB".to_string()),
        })
        .await
        .expect("payment url");
    app.drain_events().await;
    (created.order.id, url)
}

async fn attempt(app: &TestApp, txn_ref: &str) -> payment::Model {
    payment::Entity::find()
        .filter(payment::Column::TransactionRef.eq(txn_ref))
        .one(&*app.db)
        .await
        .unwrap()
        .expect("payment attempt exists")
}

#[tokio::test]
async fn payment_url_is_signed_and_recorded() {
    let app = TestApp::new().await;
    let (order_id, response) = gateway_order(&app).await;

    let url = Url::parse(&response.payment_url).unwrap();
    let params: std::collections::BTreeMap<String, String> =
        url.query_pairs().into_owned().collect();
    assert_eq!(params["vnp_TxnRef"], response.transaction_ref);
    assert_eq!(params["vnp_Amount"], "30000000");
    assert_eq!(params["vnp_IpAddr"], "203.0.113.9");
    assert_eq!(params["vnp_BankCode"], "NCB");
    assert!(response
        .transaction_ref
        .starts_with(&order_id.simple().to_string()));

    // The gateway's own check: the URL verifies against the shared secret.
    app.services().payments.signer().verify(&params).unwrap();

    let stored = attempt(&app, &response.transaction_ref).await;
    assert_eq!(stored.order_id, order_id);
    assert_eq!(stored.status, PaymentAttemptStatus::Pending);
    assert_eq!(stored.amount, app.order(order_id).await.total_amount);
}

#[tokio::test]
async fn payment_url_refuses_cod_and_foreign_orders() {
    let app = TestApp::new().await;
    let v = app.seed_variant("SKU-COD", 10_000, 10).await;
    let created = app.place_order(&[(v.id, 1)], PaymentMethod::Cod).await;

    let cod = app
        .services()
        .payments
        .build_payment_url(PaymentUrlRequest {
            order_id: created.order.id,
            customer_id: Some(app.customer_id),
            ip_addr: "127.0.0.1".into(),
            return_url: None,
            bank_code: None,
        })
        .await;
    assert_matches!(cod, Err(ServiceError::ValidationError(_)));

    let foreign = app
        .services()
        .payments
        .build_payment_url(PaymentUrlRequest {
            order_id: created.order.id,
            customer_id: Some(Uuid::new_v4()),
            ip_addr: "127.0.0.1".into(),
            return_url: None,
            bank_code: None,
        })
        .await;
    assert_matches!(foreign, Err(ServiceError::NotFound(_)));
}

#[tokio::test]
async fn approved_callback_settles_once() {
    let app = TestApp::new().await;
    let (order_id, url) = gateway_order(&app).await;
    let total = app.order(order_id).await.total_amount;
    let params = signed_callback(&url.transaction_ref, total, "00");

    let first = app.services().payments.handle_callback(&params).await.unwrap();
    assert!(first.success);
    assert_eq!(first.status, CallbackStatus::Settled);
    assert_eq!(first.order_id, order_id);

    let order = app.order(order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert!(order.paid_at.is_some());
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Pending);

    let stored = attempt(&app, &url.transaction_ref).await;
    assert_eq!(stored.status, PaymentAttemptStatus::Success);
    assert_eq!(stored.response_code.as_deref(), Some("00"));
    assert_eq!(stored.gateway_transaction_no.as_deref(), Some("14226112"));
    assert!(stored.response_data.is_some());

    // Replay of the same callback is a no-op.
    let replay = app.services().payments.handle_callback(&params).await;
    assert_matches!(
        replay,
        Ok(ref outcome) if outcome.status == CallbackStatus::AlreadySettled
    );
    assert_eq!(IpnResponse::from_result(&replay).rsp_code, "02");
    assert_eq!(app.order(order_id).await.paid_at, order.paid_at);

    let events = app.drain_events().await;
    let settled = events
        .iter()
        .filter(|e| matches!(e, Event::PaymentSettled { .. }))
        .count();
    assert_eq!(settled, 1);
}

#[tokio::test]
async fn tampered_callback_changes_nothing() {
    let app = TestApp::new().await;
    let (order_id, url) = gateway_order(&app).await;
    let total = app.order(order_id).await.total_amount;

    let mut corrupted = signed_callback(&url.transaction_ref, total, "00");
    let hash = corrupted.get_mut(SECURE_HASH).unwrap();
    let flipped = if hash.ends_with('0') { '1' } else { '0' };
    hash.pop();
    hash.push(flipped);

    let result = app.services().payments.handle_callback(&corrupted).await;
    assert_matches!(result, Err(ServiceError::SecurityError(_)));
    assert_eq!(IpnResponse::from_result(&result).rsp_code, "97");

    // Edited after signing: the amount no longer matches the signature.
    let mut edited = signed_callback(&url.transaction_ref, total, "00");
    edited.insert("vnp_Amount".into(), "100".into());
    assert_matches!(
        app.services().payments.handle_callback(&edited).await,
        Err(ServiceError::SecurityError(_))
    );

    let mut unsigned = signed_callback(&url.transaction_ref, total, "00");
    unsigned.remove(SECURE_HASH);
    assert_matches!(
        app.services().payments.handle_callback(&unsigned).await,
        Err(ServiceError::SecurityError(_))
    );

    assert_eq!(app.order(order_id).await.payment_status, PaymentStatus::Unpaid);
    assert_eq!(
        attempt(&app, &url.transaction_ref).await.status,
        PaymentAttemptStatus::Pending
    );
    assert!(app.drain_events().await.is_empty());
}

#[tokio::test]
async fn declined_callback_marks_attempt_failed() {
    let app = TestApp::new().await;
    let (order_id, url) = gateway_order(&app).await;
    let total = app.order(order_id).await.total_amount;

    let outcome = app
        .services()
        .payments
        .handle_callback(&signed_callback(&url.transaction_ref, total, "24"))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.status, CallbackStatus::Declined);
    assert_eq!(app.order(order_id).await.payment_status, PaymentStatus::Unpaid);

    let stored = attempt(&app, &url.transaction_ref).await;
    assert_eq!(stored.status, PaymentAttemptStatus::Failed);
    assert_eq!(stored.response_code.as_deref(), Some("24"));

    let events = app.drain_events().await;
    assert_matches!(
        events.as_slice(),
        [Event::PaymentDeclined { response_code, .. }] if response_code == "24"
    );
}

#[tokio::test]
async fn mismatched_amount_is_rejected() {
    let app = TestApp::new().await;
    let (order_id, url) = gateway_order(&app).await;
    let total = app.order(order_id).await.total_amount;

    // Correctly signed, but for a different amount.
    let params = signed_callback(&url.transaction_ref, total - rust_decimal::Decimal::ONE, "00");
    let result = app.services().payments.handle_callback(&params).await;

    assert_matches!(result, Err(ServiceError::ValidationError(_)));
    assert_eq!(IpnResponse::from_result(&result).rsp_code, "04");
    assert_eq!(app.order(order_id).await.payment_status, PaymentStatus::Unpaid);
}

#[tokio::test]
async fn unknown_transaction_is_not_found() {
    let app = TestApp::new().await;
    let params = signed_callback("does-not-exist", rust_decimal::Decimal::from(1000), "00");

    let result = app.services().payments.handle_callback(&params).await;
    assert_matches!(result, Err(ServiceError::NotFound(_)));
    assert_eq!(IpnResponse::from_result(&result).rsp_code, "01");
}

#[tokio::test]
async fn callback_without_reference_is_not_found() {
    let app = TestApp::new().await;
    let mut params = signed_callback("unused", rust_decimal::Decimal::from(1000), "00");
    params.remove("vnp_TxnRef");
    resign(&mut params);

    let result = app.services().payments.handle_callback(&params).await;
    assert_matches!(result, Err(ServiceError::NotFound(_)));
    let ipn = IpnResponse::from_result(&result);
    assert_eq!(ipn.rsp_code, "01");
    assert_eq!(ipn.message, "Order not found");
}

#[tokio::test]
async fn settlement_after_cancel_flags_refund() {
    let app = TestApp::new().await;
    let (order_id, url) = gateway_order(&app).await;
    let total = app.order(order_id).await.total_amount;

    app.services()
        .lifecycle
        .cancel_order(
            order_id,
            Actor::Customer(app.customer_id),
            CancelReason::ChangedMind,
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        app.order(order_id).await.refund_status,
        Some(RefundStatus::NotApplicable)
    );

    let outcome = app
        .services()
        .payments
        .handle_callback(&signed_callback(&url.transaction_ref, total, "00"))
        .await
        .unwrap();
    assert_eq!(outcome.status, CallbackStatus::Settled);

    let order = app.order(order_id).await;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.fulfillment_status, FulfillmentStatus::Cancelled);
    assert_eq!(order.refund_status, Some(RefundStatus::Pending));
    assert_eq!(order.refund_amount, Some(total));
    assert_eq!(Some(order.updated_at), order.paid_at);
    assert!(order.updated_at > order.cancelled_at.expect("cancel time recorded"));

    // A cancelled order cannot start a new payment.
    let again = app
        .services()
        .payments
        .build_payment_url(PaymentUrlRequest {
            order_id,
            customer_id: Some(app.customer_id),
            ip_addr: "127.0.0.1".into(),
            return_url: None,
            bank_code: None,
        })
        .await;
    assert_matches!(again, Err(ServiceError::AlreadyPaid(_)));

    let attempts = payment::Entity::find()
        .filter(payment::Column::OrderId.eq(order_id))
        .count(&*app.db)
        .await
        .unwrap();
    assert_eq!(attempts, 1);
}
