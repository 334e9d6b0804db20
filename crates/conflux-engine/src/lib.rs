//! External integration engine: webhook intake, idempotent application,
//! and outbound-call resilience.
//!
//! # Pipeline
//!
//! ```text
//! external service ──▶ WebhookIntake ──▶ IdempotencyStore ──▶ EventProcessor
//!                       (validate,        (dedupe check,        (transition +
//!                        normalize)        reserve key)          outbound call)
//!                                                                    │
//!                                        CircuitGateway ◀────────────┤
//!                                        (per-service breakers)      │
//!                                                │ on transient failure
//!                                                ▼
//!                                        RetryScheduler ──▶ dispatcher
//!                                        (backoff + jitter,   (re-runs the
//!                                         time-ordered queue)  outbound leg)
//! ```
//!
//! The [`HealthAggregator`] observes every breaker transition and call
//! outcome and derives per-service status on demand.
//!
//! # Guarantees
//!
//! - At-most-once side effects per `(source_service, event_id)` key, across
//!   concurrent deliveries and process restarts.
//! - No outbound call reaches a service whose circuit is open; one probe at
//!   a time tests recovery.
//! - Retry delays are full-jitter exponential backoff, capped, with the
//!   budget suspended while a breaker is open.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod health;
pub mod idempotency;
pub mod intake;
pub mod outbound;
pub mod processor;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use circuit::{CircuitConfig, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use engine::{EngineConfig, IntegrationEngine};
pub use error::{EngineError, Result};
pub use health::{HealthAggregator, HealthConfig, OutcomeLog};
pub use idempotency::{IdempotencyConfig, IdempotencyStore, ReservationVerdict};
pub use intake::{RawDelivery, SigningSecrets, WebhookIntake};
pub use outbound::{
    CircuitGateway, HttpOutboundClient, OutboundClient, OutboundConfig, OutboundMethod,
    OutboundRequest, OutboundResponse,
};
pub use processor::{EventProcessor, ProcessingResult};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{DeliveryAttempt, RetryScheduler};
pub use storage::{PostgresRecordStore, RecordStore};
