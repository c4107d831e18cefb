//! Service-level error types for the gateway and ingestion pipelines

use crate::adapters::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the connection pool layer
#[derive(Error, Debug)]
pub enum PoolError {
    /// The pool's circuit breaker is open; the call was rejected without
    /// touching the device
    #[error("circuit breaker open")]
    CircuitOpen,

    /// All connection slots are leased and none freed within the timeout
    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("pool is shut down")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl PoolError {
    /// Rejections are expected back-pressure, not failures; they get their
    /// own counters and must not feed the breaker
    pub fn is_rejection(&self) -> bool {
        matches!(self, PoolError::CircuitOpen | PoolError::PoolExhausted)
    }
}

/// Errors raised while loading or validating the device registry
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid device config: {0}")]
    InvalidDevice(String),

    #[error("invalid tag config: {0}")]
    InvalidTag(String),

    #[error("duplicate id: {0}")]
    DuplicateId(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Errors raised on the ingestion side
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("batch dropped after {attempts} attempts: {source}")]
    GaveUp {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },
}

/// Classify a sqlx error as transient (worth a retry) or permanent
///
/// Connection-level failures, timeouts and pool exhaustion recover on their
/// own; schema and auth errors never do.
pub fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            // serialization_failure, deadlock_detected, admin_shutdown,
            // crash_shutdown, cannot_connect_now, too_many_connections
            matches!(
                db.code().as_deref(),
                Some("40001") | Some("40P01") | Some("57P01") | Some("57P02") | Some("57P03")
                    | Some("53300")
            )
        }
        _ => false,
    }
}

pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_rejections() {
        assert!(PoolError::CircuitOpen.is_rejection());
        assert!(PoolError::PoolExhausted.is_rejection());
        assert!(!PoolError::Protocol(ProtocolError::Timeout).is_rejection());
    }

    #[test]
    fn test_transient_db_errors() {
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
        assert!(is_transient_db_error(&sqlx::Error::Io(
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused")
        )));
        assert!(!is_transient_db_error(&sqlx::Error::RowNotFound));
    }
}
