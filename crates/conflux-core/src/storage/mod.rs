//! Database access layer implementing the repository pattern.
//!
//! Repositories translate between domain models and the database schema.
//! All SQL lives here; components above this layer never issue queries
//! directly.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

pub mod audit_log;
pub mod entities;
pub mod processed_events;

pub use processed_events::{RecordFilter, ReserveOutcome};

use crate::{
    access::{DataAccess, Entity, Transition},
    error::{CoreError, Result},
    models::{AuditEntry, EntityRef, TenantId},
    time::{now_utc, Clock},
};

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Repository for processed-event records (idempotency store backing).
    pub processed_events: Arc<processed_events::Repository>,

    /// Repository for the minimal entity table.
    pub entities: Arc<entities::Repository>,

    /// Repository for audit log entries.
    pub audit_log: Arc<audit_log::Repository>,
}

impl Storage {
    /// Creates a new storage instance sharing one connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            processed_events: Arc::new(processed_events::Repository::new(pool.clone())),
            entities: Arc::new(entities::Repository::new(pool.clone())),
            audit_log: Arc::new(audit_log::Repository::new(pool)),
        }
    }

    /// Verifies database connectivity with a trivial query.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.processed_events.pool()).await?;

        Ok(())
    }
}

/// Postgres-backed [`DataAccess`] adapter.
///
/// Stands in for the external CRUD subsystem using the minimal entity and
/// audit tables. Transition legality comes from [`Transition::apply`], so
/// this adapter and the in-memory test double agree on semantics.
pub struct PgDataAccess {
    storage: Storage,
    clock: Arc<dyn Clock>,
}

impl PgDataAccess {
    /// Creates a new adapter over the given storage.
    pub fn new(storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

#[async_trait]
impl DataAccess for PgDataAccess {
    async fn get_entity(&self, tenant: &TenantId, entity: &EntityRef) -> Result<Option<Entity>> {
        self.storage.entities.find(tenant, entity).await
    }

    async fn apply_transition(
        &self,
        tenant: &TenantId,
        entity: &EntityRef,
        transition: Transition,
    ) -> Result<()> {
        let existing = self.storage.entities.find(tenant, entity).await?;

        let (mut state, mut active) = match existing {
            Some(found) => (found.state, found.active),
            None if transition.creates_entity() => (Value::Object(serde_json::Map::new()), true),
            None => return Err(CoreError::NotFound(format!("entity {entity}"))),
        };

        transition.apply(&mut state, &mut active)?;

        self.storage
            .entities
            .upsert(tenant, entity, &state, active, now_utc(self.clock.as_ref()))
            .await
    }

    async fn write_audit_entry(&self, entry: AuditEntry) -> Result<()> {
        self.storage.audit_log.insert(&entry).await
    }
}
