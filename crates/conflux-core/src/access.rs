//! Data-access interface to the CRUD subsystem.
//!
//! The tenant/user management surface is an external collaborator. The
//! engine reads and writes internal state exclusively through this narrow
//! interface and never touches that subsystem's storage directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::Result,
    models::{AuditEntry, EntityRef, TenantId},
};

/// Internal entity snapshot returned by [`DataAccess::get_entity`].
///
/// The engine treats entity state as opaque JSON; only the `active` flag is
/// interpreted directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// Reference identifying this entity.
    pub reference: EntityRef,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Opaque entity state.
    pub state: Value,
    /// Whether the entity is active.
    pub active: bool,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

/// Business-level state transition applied to an internal entity.
///
/// One variant per webhook-driven effect. The CRUD subsystem decides whether
/// a transition is legal for the entity's current state and answers with a
/// conflict error when it is not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Transition {
    /// Create or update a local user from upstream attributes.
    UpsertUser {
        /// Upstream user attributes.
        attributes: Value,
    },
    /// Deactivate the local user after upstream deletion.
    DeactivateUser,
    /// Mark a subscription active.
    ActivateSubscription,
    /// Mark a subscription cancelled and inactive.
    CancelSubscription,
    /// Mark a subscription past due after a failed payment.
    MarkSubscriptionPastDue,
    /// Record successful delivery of an outbound message.
    RecordMessageDelivered,
    /// Record a bounced outbound message.
    RecordMessageBounced,
}

impl Transition {
    /// Stable name used for audit actions and logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::UpsertUser { .. } => "user.upsert",
            Self::DeactivateUser => "user.deactivate",
            Self::ActivateSubscription => "subscription.activate",
            Self::CancelSubscription => "subscription.cancel",
            Self::MarkSubscriptionPastDue => "subscription.mark_past_due",
            Self::RecordMessageDelivered => "message.record_delivered",
            Self::RecordMessageBounced => "message.record_bounced",
        }
    }

    /// True when the transition may create the entity if it does not exist.
    pub fn creates_entity(&self) -> bool {
        matches!(self, Self::UpsertUser { .. })
    }

    /// Applies the transition to an entity's state in place.
    ///
    /// Shared by every [`DataAccess`] implementation so Postgres and the
    /// in-memory test double agree on transition legality.
    pub fn apply(&self, state: &mut Value, active: &mut bool) -> crate::error::Result<()> {
        use crate::error::CoreError;

        match self {
            Self::UpsertUser { attributes } => {
                *state = attributes.clone();
                *active = true;
            },
            Self::DeactivateUser => *active = false,
            Self::ActivateSubscription => {
                if state.get("status").and_then(Value::as_str) == Some("cancelled") {
                    return Err(CoreError::Conflict(
                        "cannot activate a cancelled subscription".to_string(),
                    ));
                }
                state["status"] = Value::from("active");
                *active = true;
            },
            Self::CancelSubscription => {
                state["status"] = Value::from("cancelled");
                *active = false;
            },
            Self::MarkSubscriptionPastDue => state["status"] = Value::from("past_due"),
            Self::RecordMessageDelivered => {
                state["delivery_status"] = Value::from("delivered");
            },
            Self::RecordMessageBounced => state["delivery_status"] = Value::from("bounced"),
        }
        Ok(())
    }
}

/// Narrow interface the engine consumes from the CRUD subsystem.
///
/// Implementations must enforce tenant isolation: an entity is only visible
/// through the tenant that owns it.
#[async_trait]
pub trait DataAccess: Send + Sync + 'static {
    /// Fetches an entity, or `None` when it does not exist for the tenant.
    async fn get_entity(&self, tenant: &TenantId, entity: &EntityRef) -> Result<Option<Entity>>;

    /// Applies a state transition to an entity.
    ///
    /// Returns `CoreError::NotFound` for missing entities (except upserts),
    /// `CoreError::Conflict` when the entity's current state rejects the
    /// transition.
    async fn apply_transition(
        &self,
        tenant: &TenantId,
        entity: &EntityRef,
        transition: Transition,
    ) -> Result<()>;

    /// Records an audit entry for an applied event.
    async fn write_audit_entry(&self, entry: AuditEntry) -> Result<()>;
}

pub mod mock {
    //! In-memory data-access implementation for tests.
    //!
    //! Applies the same transition semantics a real CRUD subsystem would,
    //! against a `HashMap`, and records everything for verification.

    use std::collections::HashMap;

    use chrono::Utc;
    use tokio::sync::RwLock;

    use super::{async_trait, DataAccess, Entity, Result, Transition, Value};
    use crate::{
        error::CoreError,
        models::{AuditEntry, EntityRef, TenantId},
    };

    /// In-memory [`DataAccess`] with failure injection.
    #[derive(Debug, Default)]
    pub struct InMemoryDataAccess {
        entities: RwLock<HashMap<(TenantId, EntityRef), Entity>>,
        audit: RwLock<Vec<AuditEntry>>,
        applied: RwLock<Vec<(TenantId, EntityRef, &'static str)>>,
        fail_next: RwLock<Option<CoreError>>,
    }

    impl InMemoryDataAccess {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Seeds a tenant entity so tenant-existence checks pass.
        pub async fn seed_tenant(&self, tenant: &TenantId) {
            self.seed_entity(
                tenant,
                EntityRef::new("tenant", tenant.as_str()),
                serde_json::json!({ "name": tenant.as_str() }),
            )
            .await;
        }

        /// Seeds an arbitrary entity.
        pub async fn seed_entity(&self, tenant: &TenantId, reference: EntityRef, state: Value) {
            let entity = Entity {
                reference: reference.clone(),
                tenant_id: tenant.clone(),
                state,
                active: true,
                updated_at: Utc::now(),
            };
            self.entities.write().await.insert((tenant.clone(), reference), entity);
        }

        /// Makes the next operation fail with the given error.
        pub async fn fail_next(&self, error: CoreError) {
            *self.fail_next.write().await = Some(error);
        }

        /// Transitions applied so far, in order.
        pub async fn applied_transitions(&self) -> Vec<(TenantId, EntityRef, &'static str)> {
            self.applied.read().await.clone()
        }

        /// Audit entries written so far.
        pub async fn audit_entries(&self) -> Vec<AuditEntry> {
            self.audit.read().await.clone()
        }

        /// Fetches an entity snapshot for assertions.
        pub async fn entity(&self, tenant: &TenantId, reference: &EntityRef) -> Option<Entity> {
            self.entities.read().await.get(&(tenant.clone(), reference.clone())).cloned()
        }

        async fn take_injected_failure(&self) -> Option<CoreError> {
            self.fail_next.write().await.take()
        }
    }

    #[async_trait]
    impl DataAccess for InMemoryDataAccess {
        async fn get_entity(
            &self,
            tenant: &TenantId,
            entity: &EntityRef,
        ) -> Result<Option<Entity>> {
            if let Some(err) = self.take_injected_failure().await {
                return Err(err);
            }
            Ok(self.entities.read().await.get(&(tenant.clone(), entity.clone())).cloned())
        }

        async fn apply_transition(
            &self,
            tenant: &TenantId,
            entity: &EntityRef,
            transition: Transition,
        ) -> Result<()> {
            if let Some(err) = self.take_injected_failure().await {
                return Err(err);
            }

            let mut entities = self.entities.write().await;
            let key = (tenant.clone(), entity.clone());

            if !entities.contains_key(&key) {
                if !transition.creates_entity() {
                    return Err(CoreError::NotFound(format!("entity {entity}")));
                }
                entities.insert(
                    key.clone(),
                    Entity {
                        reference: entity.clone(),
                        tenant_id: tenant.clone(),
                        state: Value::Object(serde_json::Map::new()),
                        active: true,
                        updated_at: Utc::now(),
                    },
                );
            }

            let name = transition.name();
            let record = entities.get_mut(&key).expect("entity inserted above");
            transition.apply(&mut record.state, &mut record.active)?;
            record.updated_at = Utc::now();
            drop(entities);

            self.applied.write().await.push((tenant.clone(), entity.clone(), name));
            Ok(())
        }

        async fn write_audit_entry(&self, entry: AuditEntry) -> Result<()> {
            if let Some(err) = self.take_injected_failure().await {
                return Err(err);
            }
            self.audit.write().await.push(entry);
            Ok(())
        }
    }

}
