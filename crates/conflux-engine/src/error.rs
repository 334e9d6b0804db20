//! Error taxonomy for the integration engine.
//!
//! Every failure mode in the pipeline maps to exactly one variant, and each
//! variant has a fixed disposition: rejected synchronously, retried, deferred,
//! or permanently ignored. The HTTP layer maps variants to status codes; the
//! retry scheduler consults [`EngineError::is_transient`].

use conflux_core::{CoreError, DedupeKey, SourceService};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Failure modes of webhook intake, processing, and outbound calls.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Payload failed structural validation. Rejected, never retried.
    #[error("malformed event: {reason}")]
    MalformedEvent {
        /// What was missing or invalid.
        reason: String,
    },

    /// Signature verification failed. Security failure, never retried.
    #[error("invalid signature for {service}")]
    InvalidSignature {
        /// Service whose secret failed to verify the payload.
        service: SourceService,
    },

    /// Another in-flight attempt holds the dedupe key. Caller may retry the
    /// HTTP request later.
    #[error("concurrent processing in flight for {key}")]
    ConcurrentProcessing {
        /// The contested dedupe key.
        key: DedupeKey,
    },

    /// Circuit breaker is open; no call was attempted.
    #[error("circuit open for {service}")]
    CircuitOpen {
        /// Service whose breaker is open.
        service: SourceService,
    },

    /// Outbound call failed with a recoverable error (network, 5xx).
    #[error("transient call failure to {service}: {reason}")]
    TransientCall {
        /// Target service.
        service: SourceService,
        /// Underlying failure description.
        reason: String,
    },

    /// Outbound call exceeded its timeout. Counts as a failure.
    #[error("call to {service} timed out after {timeout_seconds}s")]
    Timeout {
        /// Target service.
        service: SourceService,
        /// Configured timeout that elapsed.
        timeout_seconds: u64,
    },

    /// Internal state rejected the transition. Marked ignored, surfaced to
    /// operators, never retried.
    #[error("permanent apply failure: {reason}")]
    PermanentApply {
        /// Why the event cannot be applied.
        reason: String,
    },

    /// The idempotency store is unreachable. Intake fails closed (503) and
    /// the upstream sender is expected to redeliver.
    #[error("storage unavailable: {reason}")]
    StorageUnavailable {
        /// Underlying storage failure.
        reason: String,
    },

    /// Retry budget exhausted for a delivery attempt.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made before giving up.
        attempts: u32,
    },

    /// Invalid engine or service configuration.
    #[error("configuration error: {reason}")]
    Configuration {
        /// Configuration problem description.
        reason: String,
    },
}

impl EngineError {
    /// Creates a malformed-event error.
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEvent { reason: reason.into() }
    }

    /// Creates an invalid-signature error.
    pub fn invalid_signature(service: SourceService) -> Self {
        Self::InvalidSignature { service }
    }

    /// Creates a circuit-open error.
    pub fn circuit_open(service: SourceService) -> Self {
        Self::CircuitOpen { service }
    }

    /// Creates a transient call failure.
    pub fn transient(service: SourceService, reason: impl Into<String>) -> Self {
        Self::TransientCall { service, reason: reason.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(service: SourceService, timeout_seconds: u64) -> Self {
        Self::Timeout { service, timeout_seconds }
    }

    /// Creates a permanent apply failure.
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::PermanentApply { reason: reason.into() }
    }

    /// Creates a storage-unavailable error.
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::StorageUnavailable { reason: reason.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    /// True when the failed operation may succeed if repeated later.
    ///
    /// Transient failures feed the retry scheduler; everything else is
    /// terminal for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientCall { .. }
                | Self::Timeout { .. }
                | Self::CircuitOpen { .. }
                | Self::StorageUnavailable { .. }
                | Self::ConcurrentProcessing { .. }
        )
    }

    /// True when the failure must count against the target's circuit
    /// breaker.
    ///
    /// Circuit-open rejections never report back (no call happened), and
    /// permanent apply failures describe our state, not the remote service.
    pub fn counts_as_circuit_failure(&self) -> bool {
        matches!(self, Self::TransientCall { .. } | Self::Timeout { .. })
    }
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Unavailable(reason) | CoreError::Database(reason) => {
                Self::StorageUnavailable { reason }
            },
            CoreError::NotFound(what) => Self::PermanentApply { reason: format!("{what} not found") },
            CoreError::Conflict(reason) => Self::PermanentApply { reason },
            CoreError::ConstraintViolation(reason) | CoreError::InvalidInput(reason) => {
                Self::PermanentApply { reason }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_identified() {
        assert!(EngineError::transient(SourceService::Payment, "connection reset").is_transient());
        assert!(EngineError::timeout(SourceService::User, 30).is_transient());
        assert!(EngineError::circuit_open(SourceService::Communication).is_transient());
        assert!(EngineError::storage("pool exhausted").is_transient());

        assert!(!EngineError::malformed("missing event_id").is_transient());
        assert!(!EngineError::invalid_signature(SourceService::User).is_transient());
        assert!(!EngineError::permanent("tenant missing").is_transient());
        assert!(!EngineError::RetriesExhausted { attempts: 8 }.is_transient());
    }

    #[test]
    fn circuit_open_does_not_count_as_circuit_failure() {
        assert!(!EngineError::circuit_open(SourceService::Payment).counts_as_circuit_failure());
        assert!(EngineError::timeout(SourceService::Payment, 30).counts_as_circuit_failure());
        assert!(
            EngineError::transient(SourceService::Payment, "refused").counts_as_circuit_failure()
        );
        assert!(!EngineError::permanent("bad state").counts_as_circuit_failure());
    }

    #[test]
    fn core_errors_map_by_disposition() {
        let unavailable = EngineError::from(CoreError::Unavailable("pool".into()));
        assert!(matches!(unavailable, EngineError::StorageUnavailable { .. }));

        let missing = EngineError::from(CoreError::NotFound("tenant tenant_9".into()));
        assert!(matches!(missing, EngineError::PermanentApply { .. }));

        let conflict = EngineError::from(CoreError::Conflict("already cancelled".into()));
        assert!(matches!(conflict, EngineError::PermanentApply { .. }));
    }
}
