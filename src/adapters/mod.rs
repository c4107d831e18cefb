//! Protocol adapter layer
//!
//! Converts between the uniform tag read/write interface and the wire
//! protocols the gateway speaks (Modbus TCP/RTU, OPC UA, Siemens S7).
//!
//! ```text
//! Scheduler → Connection Pool → Protocol Adapter → DataPoint → Publisher
//! ```
//!
//! All adapters translate protocol-specific data into normalized
//! [`DataPoint`](crate::model::DataPoint)s. A batch read returns one point
//! per input tag; per-tag failures become quality `bad` without aborting the
//! call, while losing the connection itself surfaces `ConnectionLost` so the
//! pool's circuit breaker can count it.

use crate::model::{DataPoint, Device, Tag, TagValue};
use async_trait::async_trait;
use thiserror::Error;

pub mod factory;
pub mod modbus;
pub mod opcua;
pub mod s7;
pub mod s7_wire;

/// Protocol-specific errors with retry categorization
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not connected to device")]
    NotConnected,

    #[error("tag is not writable: {0}")]
    NotWritable(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("value type mismatch: {0}")]
    TypeMismatch(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("timeout waiting for response")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Transient errors worth retrying; the circuit breaker counts these
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionFailed(_)
                | ProtocolError::ConnectionLost(_)
                | ProtocolError::NotConnected
                | ProtocolError::Timeout
                | ProtocolError::Io(_)
        )
    }

    /// Configuration or addressing problems; retrying cannot help
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidAddress(_)
                | ProtocolError::InvalidConfiguration(_)
                | ProtocolError::UnsupportedProtocol(_)
                | ProtocolError::NotWritable(_)
                | ProtocolError::TypeMismatch(_)
        )
    }

    /// Error category for logging and metrics labels
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::ConnectionFailed(_)
            | ProtocolError::ConnectionLost(_)
            | ProtocolError::NotConnected => ErrorCategory::Network,
            ProtocolError::InvalidAddress(_)
            | ProtocolError::InvalidConfiguration(_)
            | ProtocolError::UnsupportedProtocol(_) => ErrorCategory::Config,
            ProtocolError::NotWritable(_) | ProtocolError::TypeMismatch(_) => {
                ErrorCategory::Validation
            }
            ProtocolError::ReadFailed(_) | ProtocolError::WriteFailed(_) => ErrorCategory::Protocol,
            ProtocolError::Timeout => ErrorCategory::Timeout,
            ProtocolError::Io(_) => ErrorCategory::Io,
        }
    }
}

/// Error category for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Config,
    Validation,
    Protocol,
    Timeout,
    Io,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Config => "config",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Io => "io",
        }
    }
}

/// Uniform device interface implemented per protocol
///
/// One adapter instance owns one connection. Concurrent operations on the
/// same socket are serialized by the pool's per-connection mutex; adapters
/// themselves take `&mut self`.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Open the connection to the device
    async fn connect(&mut self) -> Result<(), ProtocolError>;

    /// Best-effort batch read: one DataPoint per input tag. Individual tag
    /// failures are reported as quality `bad`; only a lost connection fails
    /// the whole call.
    async fn read_tags(
        &mut self,
        device: &Device,
        tags: &[Tag],
    ) -> Result<Vec<DataPoint>, ProtocolError>;

    /// Write a value to a single tag, applying reverse scaling before
    /// encoding. Fails with `NotWritable` for read-only addresses.
    async fn write_tag(
        &mut self,
        device: &Device,
        tag: &Tag,
        value: &TagValue,
    ) -> Result<(), ProtocolError>;

    /// Cheap liveness probe used by the pool's health checker
    async fn ping(&mut self) -> Result<(), ProtocolError>;

    /// Close the connection gracefully
    async fn close(&mut self) -> Result<(), ProtocolError>;

    fn is_connected(&self) -> bool;

    fn protocol_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProtocolError::ConnectionLost("reset".into()).is_retryable());
        assert!(ProtocolError::Timeout.is_retryable());
        assert!(!ProtocolError::InvalidAddress("x".into()).is_retryable());
        assert!(!ProtocolError::NotWritable("t".into()).is_retryable());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::InvalidConfiguration("bad".into()).is_fatal());
        assert!(ProtocolError::NotWritable("t".into()).is_fatal());
        assert!(!ProtocolError::Timeout.is_fatal());
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ProtocolError::ConnectionLost("x".into()).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            ProtocolError::ReadFailed("x".into()).category(),
            ErrorCategory::Protocol
        );
        assert_eq!(ProtocolError::Timeout.category(), ErrorCategory::Timeout);
    }
}
