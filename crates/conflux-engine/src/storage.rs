//! Storage abstraction for the idempotency store.
//!
//! The engine talks to processed-event records through this trait so the
//! processing pipeline can be tested without a database. Production uses the
//! Postgres repositories from `conflux-core`; tests use the in-memory
//! implementation, which honors the same compare-and-set reservation
//! semantics under a single lock.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conflux_core::{
    error::Result,
    models::{DedupeKey, ProcessedEventRecord, WebhookEvent},
    storage::{RecordFilter, ReserveOutcome, Storage},
};

/// Processed-event record operations required by the engine.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Atomically reserves a dedupe key, reclaiming stale or failed rows.
    ///
    /// Exactly one concurrent caller per key observes
    /// [`ReserveOutcome::Reserved`].
    async fn try_reserve(
        &self,
        event: &WebhookEvent,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<ReserveOutcome>;

    /// Transitions a held reservation to `applied`. Terminal.
    async fn mark_applied(&self, key: &DedupeKey, now: DateTime<Utc>) -> Result<()>;

    /// Transitions a held reservation to `ignored`. Terminal.
    async fn mark_ignored(&self, key: &DedupeKey, reason: &str) -> Result<()>;

    /// Transitions a held reservation to `failed` after retry exhaustion.
    async fn mark_failed(&self, key: &DedupeKey, attempts: u32, error: &str) -> Result<()>;

    /// Drops a held reservation without recording an outcome.
    async fn release(&self, key: &DedupeKey) -> Result<()>;

    /// Looks up a record by dedupe key.
    async fn find(&self, key: &DedupeKey) -> Result<Option<ProcessedEventRecord>>;

    /// Lists records for the ops endpoint, newest first.
    async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProcessedEventRecord>>;

    /// Counts records matching a filter.
    async fn count(&self, filter: &RecordFilter) -> Result<i64>;
}

/// Production record store backed by Postgres.
pub struct PostgresRecordStore {
    storage: Arc<Storage>,
}

impl PostgresRecordStore {
    /// Creates a new Postgres-backed record store.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn try_reserve(
        &self,
        event: &WebhookEvent,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<ReserveOutcome> {
        self.storage.processed_events.try_reserve(event, now, staleness).await
    }

    async fn mark_applied(&self, key: &DedupeKey, now: DateTime<Utc>) -> Result<()> {
        self.storage.processed_events.mark_applied(key, now).await
    }

    async fn mark_ignored(&self, key: &DedupeKey, reason: &str) -> Result<()> {
        self.storage.processed_events.mark_ignored(key, reason).await
    }

    async fn mark_failed(&self, key: &DedupeKey, attempts: u32, error: &str) -> Result<()> {
        self.storage.processed_events.mark_failed(key, attempts, error).await
    }

    async fn release(&self, key: &DedupeKey) -> Result<()> {
        self.storage.processed_events.release(key).await
    }

    async fn find(&self, key: &DedupeKey) -> Result<Option<ProcessedEventRecord>> {
        self.storage.processed_events.find(key).await
    }

    async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProcessedEventRecord>> {
        self.storage.processed_events.list(filter, limit, offset).await
    }

    async fn count(&self, filter: &RecordFilter) -> Result<i64> {
        self.storage.processed_events.count(filter).await
    }
}

pub mod mock {
    //! In-memory record store for tests.
    //!
    //! A single mutex around the record map makes every reservation step
    //! atomic, mirroring the row-level atomicity of the Postgres
    //! implementation.

    use std::collections::HashMap;

    use conflux_core::{
        error::CoreError,
        models::{ProcessedStatus, TenantId},
    };
    use tokio::sync::Mutex;

    use super::{
        async_trait, DateTime, DedupeKey, Duration, ProcessedEventRecord, RecordFilter,
        RecordStore, ReserveOutcome, Result, Utc, WebhookEvent,
    };

    /// In-memory [`RecordStore`] with failure injection.
    #[derive(Debug, Default)]
    pub struct InMemoryRecordStore {
        records: Mutex<HashMap<DedupeKey, ProcessedEventRecord>>,
        unavailable: Mutex<bool>,
    }

    impl InMemoryRecordStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes every subsequent operation fail as unavailable until
        /// restored. Simulates the idempotency store being unreachable.
        pub async fn set_unavailable(&self, unavailable: bool) {
            *self.unavailable.lock().await = unavailable;
        }

        /// Seeds a record directly, for restart scenarios.
        pub async fn seed(&self, record: ProcessedEventRecord) {
            self.records.lock().await.insert(record.dedupe_key(), record);
        }

        /// Number of records held.
        pub async fn len(&self) -> usize {
            self.records.lock().await.len()
        }

        /// True when no records are held.
        pub async fn is_empty(&self) -> bool {
            self.records.lock().await.is_empty()
        }

        async fn check_available(&self) -> Result<()> {
            if *self.unavailable.lock().await {
                Err(CoreError::Unavailable("record store offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RecordStore for InMemoryRecordStore {
        async fn try_reserve(
            &self,
            event: &WebhookEvent,
            now: DateTime<Utc>,
            staleness: Duration,
        ) -> Result<ReserveOutcome> {
            self.check_available().await?;

            let mut records = self.records.lock().await;
            let key = event.dedupe_key();

            if !records.contains_key(&key) {
                records.insert(
                    key,
                    ProcessedEventRecord {
                        source_service: event.service,
                        event_id: event.event_id.clone(),
                        tenant_id: event.tenant_id.clone(),
                        event_type: event.event_type.clone(),
                        status: ProcessedStatus::Pending,
                        received_at: event.received_at,
                        reserved_at: now,
                        applied_at: None,
                        attempt_count: 1,
                        last_error: None,
                    },
                );
                return Ok(ReserveOutcome::Reserved);
            }

            let record = records.get_mut(&key).expect("record exists");
            match record.status {
                ProcessedStatus::Applied => Ok(ReserveOutcome::Applied),
                ProcessedStatus::Ignored => Ok(ReserveOutcome::Ignored),
                ProcessedStatus::Pending => {
                    let stale_before = now
                        - chrono::Duration::from_std(staleness)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));
                    if record.reserved_at < stale_before {
                        record.reserved_at = now;
                        record.attempt_count += 1;
                        Ok(ReserveOutcome::Reserved)
                    } else {
                        Ok(ReserveOutcome::Pending)
                    }
                },
                ProcessedStatus::Failed => {
                    record.status = ProcessedStatus::Pending;
                    record.reserved_at = now;
                    record.attempt_count += 1;
                    record.last_error = None;
                    Ok(ReserveOutcome::Reserved)
                },
            }
        }

        async fn mark_applied(&self, key: &DedupeKey, now: DateTime<Utc>) -> Result<()> {
            self.check_available().await?;
            if let Some(record) = self.records.lock().await.get_mut(key) {
                if record.status == ProcessedStatus::Pending {
                    record.status = ProcessedStatus::Applied;
                    record.applied_at = Some(now);
                    record.last_error = None;
                }
            }
            Ok(())
        }

        async fn mark_ignored(&self, key: &DedupeKey, reason: &str) -> Result<()> {
            self.check_available().await?;
            if let Some(record) = self.records.lock().await.get_mut(key) {
                if record.status == ProcessedStatus::Pending {
                    record.status = ProcessedStatus::Ignored;
                    record.last_error = Some(reason.to_string());
                }
            }
            Ok(())
        }

        async fn mark_failed(&self, key: &DedupeKey, attempts: u32, error: &str) -> Result<()> {
            self.check_available().await?;
            if let Some(record) = self.records.lock().await.get_mut(key) {
                if record.status == ProcessedStatus::Pending {
                    record.status = ProcessedStatus::Failed;
                    record.attempt_count = i32::try_from(attempts).unwrap_or(i32::MAX);
                    record.last_error = Some(error.to_string());
                }
            }
            Ok(())
        }

        async fn release(&self, key: &DedupeKey) -> Result<()> {
            self.check_available().await?;
            let mut records = self.records.lock().await;
            if records.get(key).is_some_and(|r| r.status == ProcessedStatus::Pending) {
                records.remove(key);
            }
            Ok(())
        }

        async fn find(&self, key: &DedupeKey) -> Result<Option<ProcessedEventRecord>> {
            self.check_available().await?;
            Ok(self.records.lock().await.get(key).cloned())
        }

        async fn list(
            &self,
            filter: &RecordFilter,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<ProcessedEventRecord>> {
            self.check_available().await?;

            let records = self.records.lock().await;
            let mut matching: Vec<ProcessedEventRecord> = records
                .values()
                .filter(|r| filter.status.is_none_or(|s| r.status == s))
                .filter(|r| filter.service.is_none_or(|s| r.source_service == s))
                .cloned()
                .collect();
            matching.sort_by(|a, b| b.received_at.cmp(&a.received_at));

            let offset = usize::try_from(offset).unwrap_or(0);
            let limit = usize::try_from(limit).unwrap_or(usize::MAX);
            Ok(matching.into_iter().skip(offset).take(limit).collect())
        }

        async fn count(&self, filter: &RecordFilter) -> Result<i64> {
            self.check_available().await?;

            let records = self.records.lock().await;
            let matching = records
                .values()
                .filter(|r| filter.status.is_none_or(|s| r.status == s))
                .filter(|r| filter.service.is_none_or(|s| r.source_service == s))
                .count();
            Ok(i64::try_from(matching).unwrap_or(i64::MAX))
        }
    }

    /// Convenience constructor for tests that need a record in a given state.
    pub fn record_with_status(
        key: &DedupeKey,
        tenant: &TenantId,
        status: ProcessedStatus,
        reserved_at: DateTime<Utc>,
    ) -> ProcessedEventRecord {
        ProcessedEventRecord {
            source_service: key.service,
            event_id: key.event_id.clone(),
            tenant_id: tenant.clone(),
            event_type: "test.event".to_string(),
            status,
            received_at: reserved_at,
            reserved_at,
            applied_at: None,
            attempt_count: 1,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use conflux_core::{models::ProcessedStatus, SourceService, TenantId};

    use super::{mock::InMemoryRecordStore, *};

    fn sample_event(event_id: &str) -> WebhookEvent {
        WebhookEvent {
            event_id: event_id.to_string(),
            service: SourceService::Payment,
            event_type: "subscription.activated".to_string(),
            tenant_id: TenantId::from("tenant_001"),
            payload: serde_json::json!({"subscription_id": "sub_1"}),
            received_at: Utc::now(),
            signature: None,
        }
    }

    #[tokio::test]
    async fn concurrent_reservations_have_one_winner() {
        let store = Arc::new(InMemoryRecordStore::new());
        let event = sample_event("evt_1");
        let now = Utc::now();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let event = event.clone();
            handles.push(tokio::spawn(async move {
                store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() == ReserveOutcome::Reserved {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one concurrent caller may win the reservation");
    }

    #[tokio::test]
    async fn applied_records_short_circuit() {
        let store = InMemoryRecordStore::new();
        let event = sample_event("evt_2");
        let now = Utc::now();

        assert_eq!(
            store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap(),
            ReserveOutcome::Reserved
        );
        store.mark_applied(&event.dedupe_key(), now).await.unwrap();

        assert_eq!(
            store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap(),
            ReserveOutcome::Applied
        );
    }

    #[tokio::test]
    async fn stale_reservations_are_reclaimable() {
        let store = InMemoryRecordStore::new();
        let event = sample_event("evt_3");
        let staleness = Duration::from_secs(300);
        let reserved_at = Utc::now();

        assert_eq!(
            store.try_reserve(&event, reserved_at, staleness).await.unwrap(),
            ReserveOutcome::Reserved
        );

        // A held reservation within the threshold is not reclaimable.
        let shortly_after = reserved_at + chrono::Duration::seconds(60);
        assert_eq!(
            store.try_reserve(&event, shortly_after, staleness).await.unwrap(),
            ReserveOutcome::Pending
        );

        // After the threshold the abandoned reservation is taken over.
        let much_later = reserved_at + chrono::Duration::seconds(301);
        assert_eq!(
            store.try_reserve(&event, much_later, staleness).await.unwrap(),
            ReserveOutcome::Reserved
        );

        let record = store.find(&event.dedupe_key()).await.unwrap().unwrap();
        assert_eq!(record.attempt_count, 2);
    }

    #[tokio::test]
    async fn failed_records_are_reclaimed_by_redelivery() {
        let store = InMemoryRecordStore::new();
        let event = sample_event("evt_4");
        let now = Utc::now();

        store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap();
        store.mark_failed(&event.dedupe_key(), 8, "retries exhausted").await.unwrap();

        assert_eq!(
            store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap(),
            ReserveOutcome::Reserved
        );
        let record = store.find(&event.dedupe_key()).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessedStatus::Pending);
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn release_clears_pending_only() {
        let store = InMemoryRecordStore::new();
        let event = sample_event("evt_5");
        let now = Utc::now();

        store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap();
        store.release(&event.dedupe_key()).await.unwrap();
        assert!(store.is_empty().await);

        store.try_reserve(&event, now, Duration::from_secs(300)).await.unwrap();
        store.mark_applied(&event.dedupe_key(), now).await.unwrap();
        store.release(&event.dedupe_key()).await.unwrap();
        assert_eq!(store.len().await, 1, "applied records are immutable");
    }

    #[tokio::test]
    async fn unavailable_store_fails_closed() {
        let store = InMemoryRecordStore::new();
        store.set_unavailable(true).await;

        let event = sample_event("evt_6");
        let err = store.try_reserve(&event, Utc::now(), Duration::from_secs(300)).await;
        assert!(err.is_err());
    }
}
