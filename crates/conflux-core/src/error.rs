//! Error types for core storage and data-access operations.

use thiserror::Error;

/// Result type alias using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error type for storage and data-access operations.
///
/// `Unavailable` is kept separate from `Database` because the engine fails
/// closed when the idempotency store is unreachable (HTTP 503, upstream
/// retries the delivery) but treats ordinary query errors as internal.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database query failed.
    #[error("database error: {0}")]
    Database(String),

    /// Storage backend unreachable (pool exhausted, connection refused).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// State transition rejected by the target entity's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl CoreError {
    /// True when the operation may succeed if repeated later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            },
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_identified() {
        assert!(CoreError::Database("connection reset".into()).is_transient());
        assert!(CoreError::Unavailable("pool timed out".into()).is_transient());

        assert!(!CoreError::NotFound("tenant".into()).is_transient());
        assert!(!CoreError::Conflict("already active".into()).is_transient());
        assert!(!CoreError::InvalidInput("bad ref".into()).is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err = CoreError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
