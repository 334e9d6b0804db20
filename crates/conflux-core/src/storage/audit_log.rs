//! Repository for audit log entries.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{error::Result, models::AuditEntry};

/// Repository for audit rows. Entries are append-only.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Appends an audit entry.
    pub async fn insert(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (tenant_id, action, entity_kind, entity_id, detail, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&entry.tenant_id)
        .bind(&entry.action)
        .bind(&entry.entity.kind)
        .bind(&entry.entity.id)
        .bind(&entry.detail)
        .bind(entry.recorded_at)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    /// Counts entries for a tenant, for monitoring queries.
    pub async fn count_for_tenant(&self, tenant_id: &str) -> Result<i64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audit_log WHERE tenant_id = $1")
                .bind(tenant_id)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count.0)
    }
}
