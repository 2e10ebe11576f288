//! HTTP API tests driven through the router with `oneshot`.

mod common;

use allocation_service::api::TENANT_HEADER;
use allocation_service::config::{
    AllocationConfig, DatabaseConfig, LedgerBackend, MatchingConfig,
};
use allocation_service::startup::{router, Application};
use service_core::config::Config as CommonConfig;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use common::{harness, invoice, payment, TENANT};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn post(uri: &str, tenant: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(tenant) = tenant {
        builder = builder.header(TENANT_HEADER, tenant);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, tenant: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(TENANT_HEADER, tenant)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_and_metrics_respond() {
    let h = harness();
    let app = router(h.app_state());

    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "allocation-service");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_header_is_required() {
    let h = harness();
    let app = router(h.app_state());
    let p = payment("pay-1", 10_000, "Jane Smith", "INV-1001");

    let (status, _) = send(&app, post("/v1/payments", None, json!({ "payments": [p] }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post("/v1/payments", Some("tenant-2"), json!({ "payments": [p] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn payment_is_applied_and_reversed_over_http() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;
    let app = router(h.app_state());
    let p = payment("pay-1", 10_000, "Jane Smith", "INV-1001");

    let (status, body) = send(
        &app,
        post("/v1/payments", Some(TENANT), json!({ "payments": [p] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let result = &body["results"][0]["result"];
    assert_eq!(result["state"], "AUTO_APPLIED");
    assert_eq!(result["chosen"]["match_type"], "REFERENCE");
    let allocation_id = result["allocations"][0]["id"].as_str().unwrap().to_string();

    let uri = format!("/v1/allocations/{}/reverse", allocation_id);
    let (status, body) = send(
        &app,
        post(&uri, Some(TENANT), json!({ "reason": "bounced" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["invoice"]["amount_due_minor_units"], 10_000);
    assert_eq!(body["allocation"]["is_reversed"], true);

    let (status, _) = send(
        &app,
        post(&uri, Some(TENANT), json!({ "reason": "bounced" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn escalated_payment_is_listed_and_resolved_manually() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;
    let app = router(h.app_state());
    let p = payment("pay-1", 8_000, "Janet Smit", "monthly");

    let (status, body) = send(
        &app,
        post("/v1/payments", Some(TENANT), json!({ "payments": [p] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["result"]["state"], "ESCALATED");

    let (status, body) = send(&app, get("/v1/escalations", TENANT)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["escalations"][0]["payment"]["id"], "pay-1");
    assert_eq!(body["escalations"][0]["reason"], "LOW_CONFIDENCE");

    let decision = json!({
        "payment": p,
        "lines": [{ "invoice_id": "inv-1", "amount_minor_units": 8_000 }],
        "match_type": "FUZZY_NAME",
        "reviewer": "bursar@school.test"
    });
    let (status, body) = send(
        &app,
        post("/v1/payments/pay-1/manual", Some(TENANT), decision.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "MANUALLY_APPLIED");

    let (_, body) = send(&app, get("/v1/escalations", TENANT)).await;
    assert_eq!(body["escalations"].as_array().unwrap().len(), 0);

    let (status, _) = send(
        &app,
        post("/v1/payments/pay-2/manual", Some(TENANT), decision),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn credit_is_applied_over_http() {
    let h = harness();
    h.add_invoice(invoice("inv-1", "INV-1001", 10_000, "Jane Smith"))
        .await;
    let app = router(h.app_state());
    let p = payment("pay-1", 12_000, "Jane Smyth", "INV-1001");
    send(
        &app,
        post("/v1/payments", Some(TENANT), json!({ "payments": [p] })),
    )
    .await;
    h.add_invoice(invoice("inv-2", "INV-1002", 1_500, "Jane Smith"))
        .await;

    let (status, body) = send(
        &app,
        post(
            &format!("/v1/contacts/{}/apply-credit", common::CONTACT),
            Some(TENANT),
            json!({}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["consumed_minor_units"], 1_500);
    assert_eq!(body["remaining_balance_minor_units"], 500);

    let (status, body) = send(
        &app,
        get(&format!("/v1/contacts/{}/credit", common::CONTACT), TENANT),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance_minor_units"], 500);
}

#[tokio::test]
async fn unknown_allocation_is_not_found() {
    let h = harness();
    let app = router(h.app_state());

    let (status, _) = send(
        &app,
        post(
            &format!("/v1/allocations/{}/reverse", uuid::Uuid::new_v4()),
            Some(TENANT),
            json!({ "reason": "duplicate" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn application_binds_with_in_memory_ledger() {
    common::init_tracing();
    let config = AllocationConfig {
        common: CommonConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
        },
        service_name: "allocation-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        ledger_backend: LedgerBackend::Memory,
        database: DatabaseConfig {
            url: None,
            max_connections: 1,
            min_connections: 1,
        },
        matching: MatchingConfig::default(),
    };

    let app = Application::build(config)
        .await
        .expect("Failed to build application");

    assert_ne!(app.http_port(), 0);
    let server = tokio::spawn(app.run_until_stopped());
    server.abort();
}
