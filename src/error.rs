//! Error types shared across the crate

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by switchboard components
#[derive(Error, Debug)]
pub enum Error {
    /// Caller passed an invalid argument (bad regex, out-of-range port, ...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation did not complete within its deadline
    #[error("communication timeout: {0}")]
    CommunicationTimeout(String),

    /// A transport open/read/write/call operation failed
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A worker task died or reported an unrecoverable error
    #[error("worker fault on port {port}: {reason}")]
    WorkerFault {
        /// Transport port the worker was driving
        port: usize,
        /// Full error text reported by the worker
        reason: String,
    },

    /// Device output or a filter file violated an expected format
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// I/O error from log or event file handling
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when this error is a communication timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::CommunicationTimeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WorkerFault {
            port: 1,
            reason: "read failed".to_string(),
        };
        assert_eq!(err.to_string(), "worker fault on port 1: read failed");
    }

    #[test]
    fn test_is_timeout() {
        assert!(Error::CommunicationTimeout("expect".into()).is_timeout());
        assert!(!Error::InvalidArgument("x".into()).is_timeout());
    }
}
