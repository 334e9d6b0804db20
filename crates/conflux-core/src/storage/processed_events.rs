//! Repository for processed-event records.
//!
//! Backs the idempotency store. The reservation path is a single atomic
//! compare-and-set per step (`INSERT .. ON CONFLICT DO NOTHING`, then guarded
//! `UPDATE .. WHERE status = ..` for reclaims) so concurrent deliveries of
//! the same event resolve to exactly one winner without advisory locks.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{DedupeKey, ProcessedEventRecord, ProcessedStatus, SourceService, WebhookEvent},
};

/// Outcome of a reservation attempt on a dedupe key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// This caller owns the key and must process the event.
    Reserved,
    /// Another attempt holds a live reservation.
    Pending,
    /// The event was already applied; side effects must not run again.
    Applied,
    /// The event was permanently rejected; it will never be retried.
    Ignored,
}

/// Filter for the ops listing endpoint.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Restrict to one status.
    pub status: Option<ProcessedStatus>,
    /// Restrict to one source service.
    pub service: Option<SourceService>,
}

/// Repository for processed-event rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Attempts to reserve a dedupe key for processing.
    ///
    /// Exactly one concurrent caller observes `Reserved`. A `pending` row
    /// older than `staleness` is treated as abandoned by a crashed attempt
    /// and reclaimed; a `failed` row is reclaimed unconditionally, since a
    /// fresh upstream redelivery restarts the retry budget.
    pub async fn try_reserve(
        &self,
        event: &WebhookEvent,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<ReserveOutcome> {
        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO processed_events (
                source_service, event_id, tenant_id, event_type,
                status, received_at, reserved_at, attempt_count
            ) VALUES ($1, $2, $3, $4, 'pending', $5, $5, 1)
            ON CONFLICT (source_service, event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event.service)
        .bind(&event.event_id)
        .bind(&event.tenant_id)
        .bind(&event.event_type)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        if inserted.is_some() {
            return Ok(ReserveOutcome::Reserved);
        }

        let key = event.dedupe_key();
        let row: Option<(ProcessedStatus,)> = sqlx::query_as(
            "SELECT status FROM processed_events WHERE source_service = $1 AND event_id = $2",
        )
        .bind(key.service)
        .bind(&key.event_id)
        .fetch_optional(&*self.pool)
        .await?;

        match row {
            // Row deleted between the conflict and the read (a concurrent
            // release). The other caller failed before side effects, so this
            // delivery may report pending and re-reserve on the next poll.
            None => Ok(ReserveOutcome::Pending),
            Some((ProcessedStatus::Applied,)) => Ok(ReserveOutcome::Applied),
            Some((ProcessedStatus::Ignored,)) => Ok(ReserveOutcome::Ignored),
            Some((ProcessedStatus::Pending,)) => self.reclaim_stale(&key, now, staleness).await,
            Some((ProcessedStatus::Failed,)) => self.reclaim_failed(&key, now).await,
        }
    }

    /// Reclaims a stale pending reservation left by a crashed attempt.
    async fn reclaim_stale(
        &self,
        key: &DedupeKey,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Result<ReserveOutcome> {
        let threshold = now
            - chrono::Duration::from_std(staleness)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let reclaimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE processed_events
            SET reserved_at = $3, attempt_count = attempt_count + 1
            WHERE source_service = $1 AND event_id = $2
              AND status = 'pending' AND reserved_at < $4
            RETURNING event_id
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .bind(now)
        .bind(threshold)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(if reclaimed.is_some() { ReserveOutcome::Reserved } else { ReserveOutcome::Pending })
    }

    /// Reclaims a terminally failed record for a fresh delivery attempt.
    async fn reclaim_failed(&self, key: &DedupeKey, now: DateTime<Utc>) -> Result<ReserveOutcome> {
        let reclaimed: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE processed_events
            SET status = 'pending', reserved_at = $3,
                attempt_count = attempt_count + 1, last_error = NULL
            WHERE source_service = $1 AND event_id = $2 AND status = 'failed'
            RETURNING event_id
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(if reclaimed.is_some() { ReserveOutcome::Reserved } else { ReserveOutcome::Pending })
    }

    /// Marks a reserved record as applied. Terminal, immutable afterwards.
    pub async fn mark_applied(&self, key: &DedupeKey, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'applied', applied_at = $3, last_error = NULL
            WHERE source_service = $1 AND event_id = $2 AND status = 'pending'
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a reserved record as permanently ignored.
    pub async fn mark_ignored(&self, key: &DedupeKey, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'ignored', last_error = $3
            WHERE source_service = $1 AND event_id = $2 AND status = 'pending'
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .bind(reason)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Marks a reserved record as failed after the retry budget ran out.
    pub async fn mark_failed(&self, key: &DedupeKey, attempts: u32, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE processed_events
            SET status = 'failed', attempt_count = $3, last_error = $4
            WHERE source_service = $1 AND event_id = $2 AND status = 'pending'
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .bind(i32::try_from(attempts).unwrap_or(i32::MAX))
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Releases a reservation without recording an outcome.
    ///
    /// Used on exit paths where no side effect ran, so a later delivery of
    /// the same event starts fresh.
    pub async fn release(&self, key: &DedupeKey) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM processed_events
            WHERE source_service = $1 AND event_id = $2 AND status = 'pending'
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Finds a record by dedupe key.
    pub async fn find(&self, key: &DedupeKey) -> Result<Option<ProcessedEventRecord>> {
        let record = sqlx::query_as::<_, ProcessedEventRecord>(
            r#"
            SELECT source_service, event_id, tenant_id, event_type, status,
                   received_at, reserved_at, applied_at, attempt_count, last_error
            FROM processed_events
            WHERE source_service = $1 AND event_id = $2
            "#,
        )
        .bind(key.service)
        .bind(&key.event_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(record)
    }

    /// Lists records for the ops endpoint, newest first.
    pub async fn list(
        &self,
        filter: &RecordFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ProcessedEventRecord>> {
        let records = sqlx::query_as::<_, ProcessedEventRecord>(
            r#"
            SELECT source_service, event_id, tenant_id, event_type, status,
                   received_at, reserved_at, applied_at, attempt_count, last_error
            FROM processed_events
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source_service = $2)
            ORDER BY received_at DESC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.service.map(|s| s.as_str().to_string()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await?;

        Ok(records)
    }

    /// Counts records matching a filter.
    pub async fn count(&self, filter: &RecordFilter) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM processed_events
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR source_service = $2)
            "#,
        )
        .bind(filter.status.map(|s| s.to_string()))
        .bind(filter.service.map(|s| s.as_str().to_string()))
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }
}
