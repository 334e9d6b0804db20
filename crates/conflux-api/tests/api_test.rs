//! HTTP-level tests for the webhook intake and read endpoints.
//!
//! Drives the full router over in-memory storage, data access, and outbound
//! transport, asserting the status-code contract of the intake error
//! taxonomy.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use conflux_api::AppState;
use conflux_core::{
    access::mock::InMemoryDataAccess, EntityRef, RealClock, SourceService, TenantId,
};
use conflux_engine::{
    crypto, outbound::mock::MockOutboundClient, storage::mock::InMemoryRecordStore, EngineConfig,
    IntegrationEngine, SigningSecrets,
};
use http_body_util::BodyExt;
use tower::ServiceExt;

struct TestApp {
    router: Router,
    records: Arc<InMemoryRecordStore>,
    access: Arc<InMemoryDataAccess>,
}

fn build_app(config: EngineConfig) -> TestApp {
    let clock = Arc::new(RealClock::new());
    let records = Arc::new(InMemoryRecordStore::new());
    let access = Arc::new(InMemoryDataAccess::new());
    let client = Arc::new(MockOutboundClient::new());

    let engine = Arc::new(IntegrationEngine::new(
        config,
        records.clone(),
        access.clone(),
        client,
        clock.clone(),
    ));
    let state = AppState::without_storage(engine, clock);

    TestApp { router: conflux_api::create_router(state), records, access }
}

async fn seed_payment_fixtures(app: &TestApp) {
    let tenant = TenantId::from("tenant_001");
    app.access.seed_tenant(&tenant).await;
    app.access
        .seed_entity(
            &tenant,
            EntityRef::new("subscription", "sub_1"),
            serde_json::json!({"status": "pending"}),
        )
        .await;
}

fn activation_body(event_id: &str) -> String {
    serde_json::json!({
        "event_id": event_id,
        "event_type": "subscription.activated",
        "tenant_id": "tenant_001",
        "data": { "subscription_id": "sub_1" }
    })
    .to_string()
}

async fn post_webhook(router: &Router, service: &str, body: String) -> (StatusCode, serde_json::Value) {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{service}"))
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let request = Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

#[tokio::test]
async fn accepted_webhook_returns_applied() {
    let app = build_app(EngineConfig::default());
    seed_payment_fixtures(&app).await;

    let (status, body) = post_webhook(&app.router, "payment-service", activation_body("evt_1")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["event_id"], "evt_1");
    assert_eq!(body["service"], "payment-service");
    assert_eq!(body["status"], "applied");
}

#[tokio::test]
async fn duplicate_delivery_returns_duplicate_applied() {
    let app = build_app(EngineConfig::default());
    seed_payment_fixtures(&app).await;

    let (first, _) = post_webhook(&app.router, "payment-service", activation_body("evt_1")).await;
    assert_eq!(first, StatusCode::OK);

    let (second, body) =
        post_webhook(&app.router, "payment-service", activation_body("evt_1")).await;
    assert_eq!(second, StatusCode::OK);
    assert_eq!(body["status"], "duplicate_applied");

    // One transition, one audit entry, despite two deliveries.
    assert_eq!(app.access.applied_transitions().await.len(), 1);
    assert_eq!(app.access.audit_entries().await.len(), 1);
}

#[tokio::test]
async fn missing_event_id_is_bad_request() {
    let app = build_app(EngineConfig::default());

    let body = serde_json::json!({
        "event_type": "subscription.activated",
        "tenant_id": "tenant_001"
    })
    .to_string();
    let (status, response) = post_webhook(&app.router, "payment-service", body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["code"], "malformed_event");
    assert!(app.records.is_empty().await, "rejected events never reach the store");
}

#[tokio::test]
async fn invalid_signature_is_unauthorized() {
    let mut secrets = SigningSecrets::new();
    secrets.set(SourceService::Payment, "whsec_payment");
    let app = build_app(EngineConfig { secrets, ..Default::default() });
    seed_payment_fixtures(&app).await;

    let body = activation_body("evt_signed");
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/payment-service")
        .header("content-type", "application/json")
        .header("x-webhook-signature", "sha256=deadbeef")
        .body(Body::from(body))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.records.is_empty().await);
}

#[tokio::test]
async fn valid_signature_is_accepted() {
    let mut secrets = SigningSecrets::new();
    secrets.set(SourceService::Payment, "whsec_payment");
    let app = build_app(EngineConfig { secrets, ..Default::default() });
    seed_payment_fixtures(&app).await;

    let body = activation_body("evt_signed");
    let signature =
        format!("sha256={}", crypto::sign_payload(body.as_bytes(), "whsec_payment").unwrap());
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/payment-service")
        .header("content-type", "application/json")
        .header("x-webhook-signature", signature)
        .body(Body::from(body))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_service_is_not_found() {
    let app = build_app(EngineConfig::default());

    let (status, response) =
        post_webhook(&app.router, "billing-service", activation_body("evt_1")).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(response["error"]["code"], "unknown_service");
}

#[tokio::test]
async fn storage_outage_returns_service_unavailable() {
    let app = build_app(EngineConfig::default());
    app.records.set_unavailable(true).await;

    let (status, response) =
        post_webhook(&app.router, "payment-service", activation_body("evt_1")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response["error"]["code"], "storage_unavailable");
}

#[tokio::test]
async fn tenant_header_resolves_tenant() {
    let app = build_app(EngineConfig::default());
    seed_payment_fixtures(&app).await;

    let body = serde_json::json!({
        "event_id": "evt_hdr",
        "event_type": "subscription.activated",
        "data": { "subscription_id": "sub_1" }
    })
    .to_string();
    let request = Request::builder()
        .method("POST")
        .uri("/webhooks/payment-service")
        .header("content-type", "application/json")
        .header("x-tenant-id", "tenant_001")
        .body(Body::from(body))
        .unwrap();

    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn event_listing_paginates_and_filters() {
    let app = build_app(EngineConfig::default());
    seed_payment_fixtures(&app).await;

    for i in 0..3 {
        let (status, _) =
            post_webhook(&app.router, "payment-service", activation_body(&format!("evt_{i}")))
                .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = get_json(&app.router, "/webhooks/events?per_page=2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);
    assert_eq!(body["items"].as_array().unwrap().len(), 2);
    assert_eq!(body["pages"], 2);

    let (status, body) = get_json(&app.router, "/webhooks/events?status=applied").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 3);

    let (status, body) = get_json(&app.router, "/webhooks/events?status=exploded").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_filter");
}

#[tokio::test]
async fn single_event_lookup() {
    let app = build_app(EngineConfig::default());
    seed_payment_fixtures(&app).await;

    post_webhook(&app.router, "payment-service", activation_body("evt_1")).await;

    let (status, body) = get_json(&app.router, "/webhooks/events/payment-service/evt_1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["event_id"], "evt_1");
    assert_eq!(body["status"], "applied");

    let (status, _) = get_json(&app.router, "/webhooks/events/payment-service/evt_missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn integration_health_lists_all_services() {
    let app = build_app(EngineConfig::default());

    let (status, body) = get_json(&app.router, "/webhooks/health").await;
    assert_eq!(status, StatusCode::OK);

    let services = body.as_array().unwrap();
    assert_eq!(services.len(), 3);
    for service in services {
        assert_eq!(service["status"], "healthy");
    }
}

#[tokio::test]
async fn probes_respond() {
    let app = build_app(EngineConfig::default());

    let (status, body) = get_json(&app.router, "/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "alive");

    // No database configured: the health check reports up.
    let (status, body) = get_json(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["database"]["status"], "up");
}
