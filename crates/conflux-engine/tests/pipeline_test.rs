//! End-to-end pipeline tests over in-memory storage, data access, and
//! outbound transport.
//!
//! Covers the engine's core guarantees: exactly-once application under
//! concurrent and repeated delivery, circuit breaking with a single recovery
//! probe, deferred outbound legs with bounded retry, reservation reclaim
//! after simulated restarts, and rejection paths that never reach the
//! idempotency store.

use std::{sync::Arc, time::Duration};

use conflux_core::{
    access::mock::InMemoryDataAccess, models::ProcessedStatus, DedupeKey, EntityRef, RealClock,
    SourceService, TenantId, TestClock,
};
use conflux_engine::{
    outbound::mock::MockOutboundClient,
    storage::mock::{record_with_status, InMemoryRecordStore},
    CircuitConfig, CircuitState, EngineConfig, EngineError, IntegrationEngine, OutboundMethod,
    OutboundRequest, ProcessingResult, RawDelivery, RecordStore, RetryPolicy,
};

struct Harness {
    engine: IntegrationEngine,
    records: Arc<InMemoryRecordStore>,
    access: Arc<InMemoryDataAccess>,
    client: Arc<MockOutboundClient>,
    clock: Arc<TestClock>,
}

fn build_harness(config: EngineConfig) -> Harness {
    let clock = Arc::new(TestClock::new());
    let records = Arc::new(InMemoryRecordStore::new());
    let access = Arc::new(InMemoryDataAccess::new());
    let client = Arc::new(MockOutboundClient::new());

    let engine = IntegrationEngine::new(
        config,
        records.clone(),
        access.clone(),
        client.clone(),
        clock.clone(),
    );

    Harness { engine, records, access, client, clock }
}

async fn seed_payment_fixtures(harness: &Harness) -> TenantId {
    let tenant = TenantId::from("tenant_001");
    harness.access.seed_tenant(&tenant).await;
    harness
        .access
        .seed_entity(
            &tenant,
            EntityRef::new("subscription", "sub_1"),
            serde_json::json!({"status": "pending"}),
        )
        .await;
    tenant
}

fn subscription_activated_body(event_id: &str) -> String {
    serde_json::json!({
        "event_id": event_id,
        "event_type": "subscription.activated",
        "tenant_id": "tenant_001",
        "data": { "subscription_id": "sub_1" }
    })
    .to_string()
}

fn payment_failed_body(event_id: &str) -> String {
    serde_json::json!({
        "event_id": event_id,
        "event_type": "payment.failed",
        "tenant_id": "tenant_001",
        "data": { "subscription_id": "sub_1" }
    })
    .to_string()
}

async fn ingest(
    harness: &Harness,
    service: SourceService,
    body: &str,
) -> conflux_engine::Result<ProcessingResult> {
    let delivery = RawDelivery { body: body.as_bytes(), tenant_header: None, signature: None };
    harness.engine.ingest(service, delivery).await.map(|(_, result)| result)
}

/// Repeatedly advances time and drains due retries until the record for
/// `key` leaves pending, or the iteration budget runs out.
async fn drain_until_settled(harness: &Harness, key: &DedupeKey, step: Duration) {
    for _ in 0..32 {
        let record = harness.records.find(key).await.unwrap();
        if record.is_some_and(|r| r.status != ProcessedStatus::Pending) {
            return;
        }
        harness.clock.advance(step);
        harness.engine.drain_due_retries().await;
    }
}

#[tokio::test]
async fn repeated_delivery_applies_once() {
    let harness = build_harness(EngineConfig::default());
    seed_payment_fixtures(&harness).await;

    let body = subscription_activated_body("evt_1");

    let first = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(first, ProcessingResult::Applied);

    let second = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(second, ProcessingResult::DuplicateApplied);

    // One transition, one audit entry, subscription active.
    assert_eq!(harness.access.applied_transitions().await.len(), 1);
    assert_eq!(harness.access.audit_entries().await.len(), 1);

    let tenant = TenantId::from("tenant_001");
    let subscription = harness
        .access
        .entity(&tenant, &EntityRef::new("subscription", "sub_1"))
        .await
        .unwrap();
    assert_eq!(subscription.state["status"], "active");

    let record = harness
        .records
        .find(&DedupeKey::new(SourceService::Payment, "evt_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProcessedStatus::Applied);
    assert!(record.applied_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_have_one_side_effect() {
    // Real clock: the losers poll the contended key on a wall-clock
    // interval and observe the winner's applied record well inside the
    // bounded wait.
    let records = Arc::new(InMemoryRecordStore::new());
    let access = Arc::new(InMemoryDataAccess::new());
    let client = Arc::new(MockOutboundClient::new());
    let engine = Arc::new(IntegrationEngine::new(
        EngineConfig::default(),
        records.clone(),
        access.clone(),
        client,
        Arc::new(RealClock::new()),
    ));

    let tenant = TenantId::from("tenant_001");
    access.seed_tenant(&tenant).await;
    access
        .seed_entity(
            &tenant,
            EntityRef::new("subscription", "sub_1"),
            serde_json::json!({"status": "pending"}),
        )
        .await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let body = subscription_activated_body("evt_racy");
            let delivery =
                RawDelivery { body: body.as_bytes(), tenant_header: None, signature: None };
            engine.ingest(SourceService::Payment, delivery).await.map(|(_, r)| r)
        }));
    }

    let mut applied = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            ProcessingResult::Applied => applied += 1,
            ProcessingResult::DuplicateApplied => duplicates += 1,
            other => panic!("unexpected concurrent outcome: {other:?}"),
        }
    }

    assert_eq!(applied, 1, "exactly one delivery may apply side effects");
    assert_eq!(duplicates, 7);
    assert_eq!(access.applied_transitions().await.len(), 1);
    assert_eq!(access.audit_entries().await.len(), 1);
}

#[tokio::test]
async fn malformed_payload_never_reaches_the_store() {
    let harness = build_harness(EngineConfig::default());

    let body = serde_json::json!({
        "event_type": "subscription.activated",
        "tenant_id": "tenant_001"
    })
    .to_string();

    let err = ingest(&harness, SourceService::Payment, &body).await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedEvent { .. }));
    assert!(harness.records.is_empty().await);
}

#[tokio::test]
async fn unknown_tenant_is_ignored_permanently() {
    let harness = build_harness(EngineConfig::default());
    // No tenant seeded.

    let body = subscription_activated_body("evt_orphan");
    let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert!(matches!(result, ProcessingResult::Ignored { .. }));

    let record = harness
        .records
        .find(&DedupeKey::new(SourceService::Payment, "evt_orphan"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, ProcessedStatus::Ignored);
    assert!(record.last_error.as_deref().unwrap_or_default().contains("tenant"));

    // Redelivery reports the rejection without reprocessing.
    let again = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert!(matches!(again, ProcessingResult::Ignored { .. }));
    assert!(harness.access.applied_transitions().await.is_empty());
}

#[tokio::test]
async fn transient_outbound_failure_defers_then_applies() {
    let harness = build_harness(EngineConfig::default());
    seed_payment_fixtures(&harness).await;

    harness.client.script_failures(SourceService::Communication, 1).await;

    let body = payment_failed_body("evt_pf_1");
    let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(result, ProcessingResult::Deferred);

    // The transition already ran; only the notification is pending.
    assert_eq!(harness.access.applied_transitions().await.len(), 1);
    let key = DedupeKey::new(SourceService::Payment, "evt_pf_1");
    let record = harness.records.find(&key).await.unwrap().unwrap();
    assert_eq!(record.status, ProcessedStatus::Pending);

    // A duplicate delivery during the retry window sees the in-flight
    // reservation and is told to come back later.
    let dup = ingest(&harness, SourceService::Payment, &body).await.unwrap_err();
    assert!(matches!(dup, EngineError::ConcurrentProcessing { .. }));

    drain_until_settled(&harness, &key, Duration::from_secs(5)).await;

    let record = harness.records.find(&key).await.unwrap().unwrap();
    assert_eq!(record.status, ProcessedStatus::Applied);
    // Transition did not re-run on the retry path.
    assert_eq!(harness.access.applied_transitions().await.len(), 1);
    assert_eq!(harness.access.audit_entries().await.len(), 1);
    assert_eq!(harness.client.call_count(SourceService::Communication).await, 2);
}

#[tokio::test]
async fn exhausted_retries_mark_record_failed() {
    let config = EngineConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        },
        // Keep the breaker out of the way so exhaustion is what stops us.
        circuit: CircuitConfig { failure_threshold: 100, ..Default::default() },
        ..Default::default()
    };
    let harness = build_harness(config);
    seed_payment_fixtures(&harness).await;

    harness.client.script_failures(SourceService::Communication, 10).await;

    let body = payment_failed_body("evt_pf_2");
    let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(result, ProcessingResult::Deferred);

    let key = DedupeKey::new(SourceService::Payment, "evt_pf_2");
    drain_until_settled(&harness, &key, Duration::from_secs(5)).await;

    let record = harness.records.find(&key).await.unwrap().unwrap();
    assert_eq!(record.status, ProcessedStatus::Failed);
    assert_eq!(record.attempt_count, 3);
    assert!(record.last_error.is_some());
    // Attempts 1 (inline), 2, and 3; nothing past the budget.
    assert_eq!(harness.client.call_count(SourceService::Communication).await, 3);
}

#[tokio::test]
async fn breaker_opens_and_blocks_outbound_calls() {
    let harness = build_harness(EngineConfig::default());
    seed_payment_fixtures(&harness).await;

    // Five consecutive communication failures (default threshold).
    harness.client.script_failures(SourceService::Communication, 5).await;
    for i in 0..5 {
        let body = payment_failed_body(&format!("evt_open_{i}"));
        let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
        assert_eq!(result, ProcessingResult::Deferred);
    }

    let circuits = harness.engine.circuits();
    assert_eq!(circuits.state(SourceService::Communication).await, CircuitState::Open);

    // Sixth event: the outbound leg is rejected without a network call.
    let body = payment_failed_body("evt_open_5");
    let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(result, ProcessingResult::Deferred);
    assert_eq!(harness.client.call_count(SourceService::Communication).await, 5);

    // After the cooldown the queued attempts drain through the recovered
    // service; the first dispatch is the single probe.
    for _ in 0..48 {
        harness.clock.advance(Duration::from_secs(60));
        harness.engine.drain_due_retries().await;
    }

    for i in 0..6 {
        let key = DedupeKey::new(SourceService::Payment, format!("evt_open_{i}"));
        let record = harness.records.find(&key).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessedStatus::Applied, "event {i} should settle");
    }
    assert_eq!(circuits.state(SourceService::Communication).await, CircuitState::Closed);
}

#[tokio::test]
async fn stale_reservation_is_reclaimed_after_restart() {
    let harness = build_harness(EngineConfig::default());
    let tenant = seed_payment_fixtures(&harness).await;

    // Simulate a record left behind by a process that crashed mid-flight,
    // held longer than the 300s staleness threshold.
    let key = DedupeKey::new(SourceService::Payment, "evt_stale");
    let abandoned_at =
        conflux_core::now_utc(harness.clock.as_ref()) - chrono::Duration::seconds(400);
    harness
        .records
        .seed(record_with_status(&key, &tenant, ProcessedStatus::Pending, abandoned_at))
        .await;

    let body = subscription_activated_body("evt_stale");
    let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(result, ProcessingResult::Applied);

    let record = harness.records.find(&key).await.unwrap().unwrap();
    assert_eq!(record.status, ProcessedStatus::Applied);
    assert!(record.attempt_count >= 2, "reclaim counts as a new attempt");
}

#[tokio::test]
async fn fresh_reservation_is_not_reclaimable() {
    let harness = build_harness(EngineConfig::default());
    let tenant = seed_payment_fixtures(&harness).await;

    // Held 60s ago: inside the staleness threshold, so the key is busy.
    let key = DedupeKey::new(SourceService::Payment, "evt_fresh");
    let held_at = conflux_core::now_utc(harness.clock.as_ref()) - chrono::Duration::seconds(60);
    harness
        .records
        .seed(record_with_status(&key, &tenant, ProcessedStatus::Pending, held_at))
        .await;

    let body = subscription_activated_body("evt_fresh");
    let err = ingest(&harness, SourceService::Payment, &body).await.unwrap_err();
    assert!(matches!(err, EngineError::ConcurrentProcessing { .. }));
    assert!(harness.access.applied_transitions().await.is_empty());
}

#[tokio::test]
async fn storage_outage_fails_closed() {
    let harness = build_harness(EngineConfig::default());
    harness.records.set_unavailable(true).await;

    let body = subscription_activated_body("evt_outage");
    let err = ingest(&harness, SourceService::Payment, &body).await.unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable { .. }));
}

#[tokio::test]
async fn cancelled_attempt_is_discarded_without_breaker_failure() {
    let harness = build_harness(EngineConfig::default());
    seed_payment_fixtures(&harness).await;

    harness.client.script_failures(SourceService::Communication, 1).await;
    let body = payment_failed_body("evt_cancel");
    let result = ingest(&harness, SourceService::Payment, &body).await.unwrap();
    assert_eq!(result, ProcessingResult::Deferred);

    // A newer event for the same entity supersedes the queued notification.
    let key = DedupeKey::new(SourceService::Payment, "evt_cancel");
    let superseded = OutboundRequest::new(
        &key,
        SourceService::Communication,
        OutboundMethod::Post,
        "/emails",
        serde_json::Value::Null,
    );
    harness.engine.scheduler().cancel(&superseded.fingerprint).await;

    harness.clock.advance(Duration::from_secs(60));
    let handled = harness.engine.drain_due_retries().await;
    assert_eq!(handled, 0, "cancelled attempts are discarded, not dispatched");
    assert_eq!(harness.client.call_count(SourceService::Communication).await, 1);

    // The discarded attempt is not a circuit failure: only the original
    // inline failure is on the books.
    let snapshot = harness.engine.circuits().snapshot(SourceService::Communication).await;
    assert_eq!(snapshot.window_failures, 1);
    assert_eq!(snapshot.state, CircuitState::Closed);
}
