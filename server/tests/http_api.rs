//! HTTP API tests over the in-memory store and the scripted processor.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Duration;
use competitions::engine::{Engine, EngineSettings};
use competitions::server::{AppState, build_router};
use serde_json::{Value, json};
use std::sync::Arc;
use ticket_engine_core::competition::{CompetitionStatus, NewCompetition};
use ticket_engine_core::environment::Clock;
use ticket_engine_core::retry::RetryPolicy;
use ticket_engine_testing::{FixedClock, InMemoryStore, MockPaymentGateway, payment_view, test_clock};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "s3cret";

struct TestApp {
    router: Router,
    store: InMemoryStore,
    gateway: MockPaymentGateway,
    clock: FixedClock,
}

impl TestApp {
    fn new() -> Self {
        let store = InMemoryStore::new();
        let gateway = MockPaymentGateway::new();
        let clock = test_clock();
        let fast = RetryPolicy::builder()
            .initial_delay(std::time::Duration::from_millis(1))
            .max_delay(std::time::Duration::from_millis(2))
            .jitter(false)
            .build();
        let mut settings = EngineSettings {
            approval_retry: fast.clone(),
            ..EngineSettings::default()
        };
        settings.reconciliation.retry = fast;
        let engine = Engine::new(
            Arc::new(store.clone()),
            Arc::new(gateway.clone()),
            Arc::new(clock.clone()),
            settings,
        );
        let router = build_router(AppState::new(engine, Some(ADMIN_TOKEN.to_string())));
        Self {
            router,
            store,
            gateway,
            clock,
        }
    }

    async fn competition(&self, slug: &str, total: u32) {
        let now = self.clock.now();
        self.store
            .seed_competition(
                NewCompetition {
                    slug: slug.into(),
                    title: "Win a phone".into(),
                    total_tickets: total,
                    starts_at: now - Duration::days(1),
                    ends_at: now + Duration::days(7),
                    status: CompetitionStatus::Active,
                }
                .into_competition(now),
            )
            .await;
    }

    fn purchase(&self, id: &str, payer: &str, slug: &str, quantity: u32) {
        self.gateway.insert(payment_view(
            id,
            payer,
            f64::from(quantity),
            json!({"competition": slug, "quantity": quantity}),
        ));
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::post(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }
}

#[tokio::test]
async fn health_and_readiness() {
    let app = TestApp::new();

    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = app.get("/ready").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["database"], true);
}

#[tokio::test]
async fn approve_then_complete_issues_tickets_once() {
    let app = TestApp::new();
    app.competition("pi-phone", 10).await;
    app.purchase("p1", "alice", "pi-phone", 3);

    let (status, body) = app.post("/api/payments/approve", json!({"paymentId": "p1"})).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["state"], "approved");

    app.gateway.verify_transaction("p1", "tx1");
    let (status, body) = app
        .post("/api/payments/complete", json!({"paymentId": "p1", "txid": "tx1"}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ticketNumbers"], json!([1, 2, 3]));
    assert_eq!(body["tickets"], "1-3");
    assert_eq!(body["replayed"], false);

    let (status, body) = app
        .post("/api/payments/complete", json!({"paymentId": "p1", "txid": "tx1"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ticketNumbers"], json!([1, 2, 3]));
    assert_eq!(body["replayed"], true);

    let (status, body) = app.get("/api/competitions/pi-phone").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ticketsSold"], 3);
    assert_eq!(body["remaining"], 7);

    let (status, body) = app.get("/api/payments/p1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["transactionId"], "tx1");
}

#[tokio::test]
async fn recover_endpoint_settles_a_payment_with_a_lost_callback() {
    let app = TestApp::new();
    app.competition("pi-phone", 10).await;
    app.purchase("p2", "bob", "pi-phone", 2);
    app.gateway.verify_transaction("p2", "tx2");

    let (status, body) = app.post("/api/payments/p2/recover", Value::Null).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "recovered");
    assert_eq!(body["ticketNumbers"], json!([1, 2]));

    let (status, body) = app.post("/api/payments/p2/recover", Value::Null).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_recovered");
    assert_eq!(body["ticketNumbers"], json!([1, 2]));
}

#[tokio::test]
async fn recover_reports_missing_and_unverified_payments() {
    let app = TestApp::new();
    app.competition("pi-phone", 10).await;
    app.purchase("p3", "carol", "pi-phone", 1);

    let (status, body) = app.post("/api/payments/ghost/recover", Value::Null).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found_upstream");

    let (status, body) = app.post("/api/payments/p3/recover", Value::Null).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "not_verified");
}

#[tokio::test]
async fn sold_out_completion_is_a_conflict() {
    let app = TestApp::new();
    app.competition("pi-phone", 2).await;
    app.purchase("p1", "alice", "pi-phone", 3);
    app.gateway.verify_transaction("p1", "tx1");

    let (status, body) = app
        .post("/api/payments/complete", json!({"paymentId": "p1", "txid": "tx1"}))
        .await;

    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert_eq!(body["code"], "capacity_exceeded");
    assert_eq!(app.store.competition("pi-phone").await.unwrap().tickets_sold, 0);
}

#[tokio::test]
async fn voucher_redemption_over_http() {
    let app = TestApp::new();
    app.competition("pi-phone", 10).await;

    let (status, body) = app
        .send(
            Request::post("/api/admin/vouchers")
                .header("content-type", "application/json")
                .header("x-admin-token", ADMIN_TOKEN)
                .body(Body::from(
                    json!({"code": "free1", "competition": "pi-phone", "quantity": 1, "redemptionCap": 1})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["code"], "FREE1");

    let (status, body) = app
        .post("/api/vouchers/redeem", json!({"code": "FREE1", "redeemer": "alice"}))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ticketNumbers"], json!([1]));

    let (status, body) = app
        .post("/api/vouchers/redeem", json!({"code": "free1", "redeemer": "bob"}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "voucher_exhausted");
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let app = TestApp::new();
    app.competition("pi-phone", 10).await;
    let body = json!({"totalTickets": 20}).to_string();

    let (status, _) = app
        .send(
            Request::put("/api/admin/competitions/pi-phone/capacity")
                .header("content-type", "application/json")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .send(
            Request::put("/api/admin/competitions/pi-phone/capacity")
                .header("content-type", "application/json")
                .header("x-admin-token", "wrong")
                .body(Body::from(body.clone()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .send(
            Request::put("/api/admin/competitions/pi-phone/capacity")
                .header("content-type", "application/json")
                .header("x-admin-token", ADMIN_TOKEN)
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["totalTickets"], 20);
}

#[tokio::test]
async fn refund_ledger_after_cancellation() {
    let app = TestApp::new();
    app.competition("pi-phone", 10).await;
    app.purchase("p1", "alice", "pi-phone", 2);
    app.gateway.verify_transaction("p1", "tx1");
    let (status, _) = app.post("/api/payments/p1/recover", Value::Null).await;
    assert_eq!(status, StatusCode::OK);

    let admin = |request: axum::http::request::Builder| {
        request
            .header("content-type", "application/json")
            .header("x-admin-token", ADMIN_TOKEN)
    };
    let (status, body) = app
        .send(
            admin(Request::put("/api/admin/competitions/pi-phone/status"))
                .body(Body::from(json!({"status": "cancelled"}).to_string()))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = app
        .send(
            admin(Request::get("/api/admin/competitions/pi-phone/refunds"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["payer"], "alice");
    assert_eq!(body[0]["ticketNumbers"], json!({"first": 1, "last": 2}));
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/payments/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
}
