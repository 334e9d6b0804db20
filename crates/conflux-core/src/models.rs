//! Core domain models for the integration engine.
//!
//! Defines the normalized webhook envelope, processed-event records used for
//! idempotency, and the derived integration health view. String-backed enums
//! carry manual sqlx impls so the database representation stays stable even
//! if Rust-side names change.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// External service that originates webhooks and receives outbound calls.
///
/// The engine integrates with exactly three upstream systems. Circuit
/// breakers and health tracking are keyed by this enum because the failure
/// mode being guarded against is the remote service itself, not any single
/// tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceService {
    /// User management service.
    User,
    /// Payment and subscription service.
    Payment,
    /// Email/notification delivery service.
    Communication,
}

impl SourceService {
    /// All known services, in a stable order.
    pub const ALL: [Self; 3] = [Self::User, Self::Payment, Self::Communication];

    /// Wire name used in webhook URLs and persisted records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user-service",
            Self::Payment => "payment-service",
            Self::Communication => "communication-service",
        }
    }
}

impl fmt::Display for SourceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceService {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user-service" => Ok(Self::User),
            "payment-service" => Ok(Self::Payment),
            "communication-service" => Ok(Self::Communication),
            other => Err(format!("unknown service: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for SourceService {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for SourceService {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for SourceService {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Strongly-typed tenant identifier.
///
/// Upstream services address tenants by opaque string ids (for example
/// `tenant_001`), so this wraps a `String` rather than a UUID. All engine
/// operations are scoped to a tenant.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    /// Creates a tenant id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reference to an entity owned by the CRUD subsystem.
///
/// The engine never dereferences these itself; they are passed through the
/// data-access interface. `kind` is the entity collection (`user`,
/// `subscription`, `message`, ...) and `id` the upstream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity collection name.
    pub kind: String,
    /// Identifier within the collection.
    pub id: String,
}

impl EntityRef {
    /// Creates an entity reference.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Deduplication key identifying a unique external event.
///
/// Upstream event ids are unique *within* a source service, so the key is
/// the pair. This is global per service, not tenant-scoped: upstream ids are
/// service-global and two tenants never share an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    /// Service that emitted the event.
    pub service: SourceService,
    /// Upstream event identifier.
    pub event_id: String,
}

impl DedupeKey {
    /// Creates a dedupe key.
    pub fn new(service: SourceService, event_id: impl Into<String>) -> Self {
        Self { service, event_id: event_id.into() }
    }
}

impl fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.event_id)
    }
}

/// Normalized webhook envelope.
///
/// Produced by intake from the three service-specific payload shapes.
/// Ephemeral: processed then discarded, only the dedupe key (as a
/// [`ProcessedEventRecord`]) persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Upstream event identifier, unique within the source service.
    pub event_id: String,

    /// Service that delivered the webhook.
    pub service: SourceService,

    /// Event type string, e.g. `subscription.activated`.
    pub event_type: String,

    /// Tenant the event belongs to.
    pub tenant_id: TenantId,

    /// Opaque structured payload (the upstream `data` object).
    pub payload: serde_json::Value,

    /// When intake accepted the event.
    pub received_at: DateTime<Utc>,

    /// Raw signature header value, if the sender provided one.
    pub signature: Option<String>,
}

impl WebhookEvent {
    /// Deduplication key for this event.
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::new(self.service, self.event_id.clone())
    }
}

/// Lifecycle status of a processed-event record.
///
/// ```text
/// pending -> applied   (side effects done, immutable afterwards)
///         -> ignored   (permanent apply failure, never retried)
///         -> failed    (retry budget exhausted)
/// ```
///
/// `pending` rows older than the staleness threshold are treated as
/// abandoned (crashed owner) and may be reclaimed by a new attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    /// Reservation held by an in-flight processing attempt.
    Pending,
    /// Side effects applied exactly once. Terminal.
    Applied,
    /// Rejected by internal state validation. Terminal, surfaced to operators.
    Ignored,
    /// Retry budget exhausted. Reclaimable by a fresh upstream redelivery.
    Failed,
}

impl fmt::Display for ProcessedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Applied => write!(f, "applied"),
            Self::Ignored => write!(f, "ignored"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ProcessedStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "applied" => Ok(Self::Applied),
            "ignored" => Ok(Self::Ignored),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid processed status: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for ProcessedStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProcessedStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for ProcessedStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.to_string(), buf)
    }
}

/// Durable record of an external event's processing outcome.
///
/// Owned exclusively by the idempotency store; no other component writes
/// these rows. Survives restarts so aggressive upstream redelivery can never
/// re-apply an already-applied event.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedEventRecord {
    /// Service that emitted the event.
    pub source_service: SourceService,

    /// Upstream event identifier.
    pub event_id: String,

    /// Tenant the event belongs to.
    pub tenant_id: TenantId,

    /// Event type string, kept for the ops listing endpoint.
    pub event_type: String,

    /// Current processing status.
    pub status: ProcessedStatus,

    /// When the event was first accepted.
    pub received_at: DateTime<Utc>,

    /// When the current reservation was taken.
    ///
    /// Drives staleness reclaim: a `pending` row whose `reserved_at` is
    /// older than the threshold belongs to a crashed attempt.
    pub reserved_at: DateTime<Utc>,

    /// When side effects were applied. Set only for `applied`.
    pub applied_at: Option<DateTime<Utc>>,

    /// Processing attempts so far, counting reclaims.
    pub attempt_count: i32,

    /// Most recent error, for `ignored` and `failed` records.
    pub last_error: Option<String>,
}

impl ProcessedEventRecord {
    /// Deduplication key for this record.
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey::new(self.source_service, self.event_id.clone())
    }
}

/// Derived per-service integration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Circuit closed, recent failure rate low.
    Healthy,
    /// Circuit half-open, or closed with elevated failures.
    Degraded,
    /// Circuit open.
    Down,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Point-in-time health view for one external service.
///
/// Recomputed from circuit state and the rolling outcome window on every
/// query; never persisted as a source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationHealth {
    /// Service this view describes.
    pub service: SourceService,
    /// Derived status.
    pub status: HealthStatus,
    /// Most recent successful call, if any in the window.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Most recent failed call, if any in the window.
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Consecutive failures reported to the circuit breaker.
    pub consecutive_failures: u32,
}

/// Audit entry forwarded to the CRUD subsystem.
///
/// The engine records one entry per applied event; duplicates must never
/// produce a second entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Tenant the action applies to.
    pub tenant_id: TenantId,
    /// Action name, e.g. `webhook.subscription.activated`.
    pub action: String,
    /// Entity the action touched.
    pub entity: EntityRef,
    /// Structured detail, typically the event payload.
    pub detail: serde_json::Value,
    /// When the action was recorded.
    pub recorded_at: DateTime<Utc>,
}
