//! Repository for the minimal entity table behind the data-access adapter.
//!
//! The CRUD subsystem owns entity semantics; this table is the narrow slice
//! the integration engine needs (tenants, users, subscriptions, messages as
//! opaque JSON state).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::{
    access::Entity,
    error::Result,
    models::{EntityRef, TenantId},
};

/// Repository for entity rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

/// Row shape for the entities table.
#[derive(Debug, sqlx::FromRow)]
struct EntityRow {
    tenant_id: TenantId,
    kind: String,
    entity_id: String,
    state: Value,
    active: bool,
    updated_at: DateTime<Utc>,
}

impl From<EntityRow> for Entity {
    fn from(row: EntityRow) -> Self {
        Self {
            reference: EntityRef::new(row.kind, row.entity_id),
            tenant_id: row.tenant_id,
            state: row.state,
            active: row.active,
            updated_at: row.updated_at,
        }
    }
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds an entity scoped to a tenant.
    pub async fn find(&self, tenant: &TenantId, entity: &EntityRef) -> Result<Option<Entity>> {
        let row = sqlx::query_as::<_, EntityRow>(
            r#"
            SELECT tenant_id, kind, entity_id, state, active, updated_at
            FROM entities
            WHERE tenant_id = $1 AND kind = $2 AND entity_id = $3
            "#,
        )
        .bind(tenant)
        .bind(&entity.kind)
        .bind(&entity.id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row.map(Entity::from))
    }

    /// Inserts or replaces an entity's state.
    pub async fn upsert(
        &self,
        tenant: &TenantId,
        entity: &EntityRef,
        state: &Value,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO entities (tenant_id, kind, entity_id, state, active, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (tenant_id, kind, entity_id)
            DO UPDATE SET state = $4, active = $5, updated_at = $6
            "#,
        )
        .bind(tenant)
        .bind(&entity.kind)
        .bind(&entity.id)
        .bind(state)
        .bind(active)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
