//! # Error Taxonomy
//!
//! Errors raised by the buffer pool, the capture adapter and the distribution
//! context, classified the way the hub treats them:
//!
//! | Class | Examples | Handling |
//! |-------|----------|----------|
//! | Frame drop | pool exhausted, conversion failure, invalid format | drop one frame, log at debug/warn |
//! | Protocol violation | unknown buffer returned, unknown client | ignore, log at warn |
//! | Programming error | stale buffer id, double producer release | report at error, keep running |
//! | Fatal | capture source failure | latch the controller into `Error` |
//!
//! Classification is exposed through [`HasSeverity`] and [`Recoverable`], and
//! [`log_error`] emits an error at the tracing level matching its severity.

use std::io;

use cap_convert::ConvertError;
use thiserror::Error;

use crate::core::format::{BufferId, CaptureFormat};

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected during normal operation (e.g. backpressure)
    Debug,
    Info,
    /// Tolerated misuse or a dropped frame worth noticing
    Warning,
    /// A bug in the caller; the hub keeps running
    Error,
    /// The capture session cannot continue
    Fatal,
}

/// Failures reported by [`crate::core::buffer_pool::BufferPool`].
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("buffer {0} does not exist")]
    InvalidBufferId(BufferId),

    #[error("buffer {0} is not held by the producer")]
    NotProducerHeld(BufferId),

    #[error("buffer {0} has no CPU mapping")]
    NoCpuMapping(BufferId),

    #[error("failed to share buffer {buffer_id}: {source}")]
    Share {
        buffer_id: BufferId,
        #[source]
        source: io::Error,
    },
}

/// Errors surfaced by the hub as a whole.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("buffer pool exhausted")]
    PoolExhausted,

    #[error("conversion failed: {0}")]
    Convert(#[from] ConvertError),

    #[error("invalid capture format: {0}")]
    InvalidFormat(CaptureFormat),

    #[error("unsupported rotation: {0} degrees")]
    InvalidRotation(i32),

    #[error("capture source failed: {0}")]
    CaptureSource(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("distribution context has shut down")]
    SessionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using the hub error type
pub type HubResult<T> = Result<T, HubError>;

/// Trait for errors with severity levels
pub trait HasSeverity {
    fn severity(&self) -> ErrorSeverity;
}

/// Trait for errors the hub can keep running after
pub trait Recoverable {
    /// The error affects at most one frame or one client call.
    fn is_recoverable(&self) -> bool;
}

impl HasSeverity for PoolError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            PoolError::Share { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

impl HasSeverity for HubError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            HubError::Pool(e) => e.severity(),
            HubError::PoolExhausted | HubError::InvalidFormat(_) => ErrorSeverity::Debug,
            HubError::Convert(_) | HubError::InvalidRotation(_) | HubError::ProtocolViolation(_) => {
                ErrorSeverity::Warning
            }
            HubError::CaptureSource(_) => ErrorSeverity::Fatal,
            HubError::Config(_)
            | HubError::SessionClosed
            | HubError::Io(_)
            | HubError::Json(_) => ErrorSeverity::Error,
        }
    }
}

impl Recoverable for HubError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HubError::Pool(_)
                | HubError::PoolExhausted
                | HubError::Convert(_)
                | HubError::InvalidFormat(_)
                | HubError::InvalidRotation(_)
                | HubError::ProtocolViolation(_)
        )
    }
}

/// Emits `err` at the tracing level matching its severity.
pub fn log_error(context: &str, err: &HubError) {
    match err.severity() {
        ErrorSeverity::Debug => tracing::debug!("{context}: {err}"),
        ErrorSeverity::Info => tracing::info!("{context}: {err}"),
        ErrorSeverity::Warning => tracing::warn!("{context}: {err}"),
        ErrorSeverity::Error | ErrorSeverity::Fatal => tracing::error!("{context}: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_level_errors_are_recoverable() {
        assert!(HubError::PoolExhausted.is_recoverable());
        assert!(HubError::Convert(ConvertError::StrideTooSmall).is_recoverable());
        assert!(HubError::ProtocolViolation("unknown buffer".into()).is_recoverable());
        assert!(!HubError::CaptureSource("device lost".into()).is_recoverable());
        assert!(!HubError::SessionClosed.is_recoverable());
    }

    #[test]
    fn test_severity_ordering() {
        assert_eq!(HubError::PoolExhausted.severity(), ErrorSeverity::Debug);
        assert_eq!(
            HubError::CaptureSource("x".into()).severity(),
            ErrorSeverity::Fatal
        );
        assert_eq!(
            HubError::from(PoolError::InvalidBufferId(BufferId(7))).severity(),
            ErrorSeverity::Error
        );
        assert!(ErrorSeverity::Warning < ErrorSeverity::Fatal);
    }

    #[test]
    fn test_pool_error_display() {
        let err = HubError::from(PoolError::NotProducerHeld(BufferId(3)));
        assert_eq!(err.to_string(), "buffer 3 is not held by the producer");
    }
}
