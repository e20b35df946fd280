//! Shared error type across bwlimit crates.

use thiserror::Error;

/// Stable error codes surfaced to administrative callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Non-positive limit or otherwise malformed input.
    InvalidArgument,
    /// The connection is closed or not ready for attach/detach.
    ConnectionUnavailable,
    /// Policy could not be written to (or read from) storage.
    PersistenceFailed,
    /// Configuration file is malformed or out of range.
    BadConfig,
    /// Unsupported config version.
    UnsupportedVersion,
    /// Unknown connection or alias.
    NotFound,
    /// Internal server error.
    Internal,
}

impl ErrorKind {
    /// String representation used in JSON responses.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::ConnectionUnavailable => "CONNECTION_UNAVAILABLE",
            ErrorKind::PersistenceFailed => "PERSISTENCE_FAILED",
            ErrorKind::BadConfig => "BAD_CONFIG",
            ErrorKind::UnsupportedVersion => "UNSUPPORTED_VERSION",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Shared result type.
pub type Result<T> = std::result::Result<T, BwError>;

/// Unified error type used by core and gateway.
#[derive(Debug, Error)]
pub enum BwError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("bad config: {0}")]
    BadConfig(String),
    #[error("unsupported config version")]
    UnsupportedVersion,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl BwError {
    /// Map internal error to a stable caller-facing code.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BwError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            BwError::ConnectionUnavailable(_) => ErrorKind::ConnectionUnavailable,
            BwError::Persistence(_) => ErrorKind::PersistenceFailed,
            BwError::BadConfig(_) => ErrorKind::BadConfig,
            BwError::UnsupportedVersion => ErrorKind::UnsupportedVersion,
            BwError::NotFound(_) => ErrorKind::NotFound,
            BwError::Internal(_) => ErrorKind::Internal,
        }
    }
}
