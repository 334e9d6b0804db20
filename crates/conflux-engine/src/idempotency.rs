//! Idempotency store: the single arbiter of "has this event been handled".
//!
//! Wraps a durable [`RecordStore`] with reservation semantics: exactly one
//! concurrent processing attempt per dedupe key, bounded waiting on
//! contended keys, and staleness-based reclaim of reservations abandoned by
//! a crashed process.

use std::{sync::Arc, time::Duration};

use conflux_core::{
    now_utc,
    storage::{RecordFilter, ReserveOutcome},
    Clock, DedupeKey, ProcessedEventRecord, WebhookEvent,
};
use tracing::debug;

use crate::{
    error::{EngineError, Result},
    storage::RecordStore,
};

/// Tuning for reservation behavior.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// Age after which a `pending` reservation counts as abandoned.
    pub staleness_threshold: Duration,

    /// How long a caller waits on a contended key before failing with
    /// `ConcurrentProcessing`.
    pub pending_wait: Duration,

    /// Poll interval while waiting on a contended key.
    pub pending_poll_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(300),
            pending_wait: Duration::from_secs(2),
            pending_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Verdict of a reservation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationVerdict {
    /// This caller owns the key and must process the event.
    Fresh,
    /// The event was already applied; report success without side effects.
    DuplicateApplied,
    /// The event was permanently rejected earlier; report without retrying.
    DuplicateIgnored,
}

/// Reservation-aware facade over the durable record store.
pub struct IdempotencyStore {
    store: Arc<dyn RecordStore>,
    config: IdempotencyConfig,
    clock: Arc<dyn Clock>,
}

impl IdempotencyStore {
    /// Creates the store facade.
    pub fn new(
        store: Arc<dyn RecordStore>,
        config: IdempotencyConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, config, clock }
    }

    /// Checks and reserves the event's dedupe key.
    ///
    /// Waits up to the configured bound when another attempt holds the key,
    /// then fails with `ConcurrentProcessing`; the sender may safely retry
    /// the HTTP request later. A storage failure here fails closed: nothing
    /// was reserved, nothing will be applied.
    pub async fn check_and_reserve(&self, event: &WebhookEvent) -> Result<ReservationVerdict> {
        let deadline = self.clock.now() + self.config.pending_wait;

        loop {
            let outcome = self
                .store
                .try_reserve(event, now_utc(self.clock.as_ref()), self.config.staleness_threshold)
                .await
                .map_err(|e| EngineError::storage(e.to_string()))?;

            match outcome {
                ReserveOutcome::Reserved => return Ok(ReservationVerdict::Fresh),
                ReserveOutcome::Applied => return Ok(ReservationVerdict::DuplicateApplied),
                ReserveOutcome::Ignored => return Ok(ReservationVerdict::DuplicateIgnored),
                ReserveOutcome::Pending => {
                    if self.clock.now() >= deadline {
                        debug!(key = %event.dedupe_key(), "pending wait exhausted");
                        return Err(EngineError::ConcurrentProcessing {
                            key: event.dedupe_key(),
                        });
                    }
                    self.clock.sleep(self.config.pending_poll_interval).await;
                },
            }
        }
    }

    /// Marks a held reservation as applied.
    pub async fn mark_applied(&self, key: &DedupeKey) -> Result<()> {
        self.store
            .mark_applied(key, now_utc(self.clock.as_ref()))
            .await
            .map_err(|e| EngineError::storage(e.to_string()))
    }

    /// Marks a held reservation as permanently ignored.
    pub async fn mark_ignored(&self, key: &DedupeKey, reason: &str) -> Result<()> {
        self.store.mark_ignored(key, reason).await.map_err(|e| EngineError::storage(e.to_string()))
    }

    /// Marks a held reservation as failed after retry exhaustion.
    pub async fn mark_failed(&self, key: &DedupeKey, attempts: u32, error: &str) -> Result<()> {
        self.store
            .mark_failed(key, attempts, error)
            .await
            .map_err(|e| EngineError::storage(e.to_string()))
    }

    /// Releases a held reservation without recording an outcome.
    ///
    /// Used on exit paths where no side effect ran, so the next delivery of
    /// the same event starts fresh instead of waiting out the staleness
    /// threshold.
    pub async fn release(&self, key: &DedupeKey) -> Result<()> {
        self.store.release(key).await.map_err(|e| EngineError::storage(e.to_string()))
    }

    /// Looks up a record for the read endpoints.
    pub async fn find(&self, key: &DedupeKey) -> Result<Option<ProcessedEventRecord>> {
        self.store.find(key).await.map_err(|e| EngineError::storage(e.to_string()))
    }

    /// Lists records for the read endpoints.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProcessedEventRecord>> {
        self.store.list(filter, limit, offset).await.map_err(|e| EngineError::storage(e.to_string()))
    }

    /// Counts records for pagination.
    pub async fn count(&self, filter: &RecordFilter) -> Result<i64> {
        self.store.count(filter).await.map_err(|e| EngineError::storage(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use conflux_core::{SourceService, TenantId, TestClock};

    use super::*;
    use crate::storage::mock::InMemoryRecordStore;

    fn sample_event(event_id: &str) -> WebhookEvent {
        WebhookEvent {
            event_id: event_id.to_string(),
            service: SourceService::Payment,
            event_type: "subscription.activated".to_string(),
            tenant_id: TenantId::from("tenant_001"),
            payload: serde_json::json!({}),
            received_at: Utc::now(),
            signature: None,
        }
    }

    fn store_with_clock() -> (IdempotencyStore, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new());
        let store = IdempotencyStore::new(
            Arc::new(InMemoryRecordStore::new()),
            IdempotencyConfig::default(),
            clock.clone(),
        );
        (store, clock)
    }

    #[tokio::test]
    async fn fresh_then_duplicate_applied() {
        let (store, _clock) = store_with_clock();
        let event = sample_event("evt_1");

        assert_eq!(store.check_and_reserve(&event).await.unwrap(), ReservationVerdict::Fresh);
        store.mark_applied(&event.dedupe_key()).await.unwrap();

        assert_eq!(
            store.check_and_reserve(&event).await.unwrap(),
            ReservationVerdict::DuplicateApplied
        );
    }

    #[tokio::test]
    async fn contended_key_times_out_with_concurrent_processing() {
        let (store, _clock) = store_with_clock();
        let event = sample_event("evt_2");

        assert_eq!(store.check_and_reserve(&event).await.unwrap(), ReservationVerdict::Fresh);

        // Second reservation attempt polls until the bounded wait runs out.
        // The test clock advances on each poll sleep, so this terminates
        // immediately.
        let err = store.check_and_reserve(&event).await.unwrap_err();
        assert!(matches!(err, EngineError::ConcurrentProcessing { .. }));
    }

    #[tokio::test]
    async fn ignored_records_report_duplicate_ignored() {
        let (store, _clock) = store_with_clock();
        let event = sample_event("evt_3");

        store.check_and_reserve(&event).await.unwrap();
        store.mark_ignored(&event.dedupe_key(), "tenant missing").await.unwrap();

        assert_eq!(
            store.check_and_reserve(&event).await.unwrap(),
            ReservationVerdict::DuplicateIgnored
        );
    }

    #[tokio::test]
    async fn released_key_can_be_reserved_again() {
        let (store, _clock) = store_with_clock();
        let event = sample_event("evt_4");

        store.check_and_reserve(&event).await.unwrap();
        store.release(&event.dedupe_key()).await.unwrap();

        assert_eq!(store.check_and_reserve(&event).await.unwrap(), ReservationVerdict::Fresh);
    }

    #[tokio::test]
    async fn storage_outage_surfaces_as_unavailable() {
        let clock = Arc::new(TestClock::new());
        let backing = Arc::new(InMemoryRecordStore::new());
        backing.set_unavailable(true).await;
        let store = IdempotencyStore::new(backing, IdempotencyConfig::default(), clock);

        let err = store.check_and_reserve(&sample_event("evt_5")).await.unwrap_err();
        assert!(matches!(err, EngineError::StorageUnavailable { .. }));
    }
}
