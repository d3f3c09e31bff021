//! Error types for configuration database operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by keys, sources and databases.
///
/// These are the typed failures an RPC caller sees. Errors raised while
/// notifying listeners or writing the saved-state log never end up here.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfError {
    /// The key or directory name is malformed.
    #[error("bad key `{key}`: {reason}")]
    BadKey { key: String, reason: String },

    /// A source address could not be resolved.
    #[error("bad address `{address}`: {reason}")]
    BadAddress { address: String, reason: String },

    /// A value or record could not be parsed.
    #[error("parse error: {0}")]
    ParseError(String),

    /// A backing source exists but its contents are unreadable.
    #[error("configuration source is corrupt: {0}")]
    Corrupt(String),

    /// A value does not match the type its schema declares.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// A directory was used where a key was expected.
    #[error("`{0}` is a directory, not a key")]
    IsDir(String),

    /// A key was used where a directory was expected.
    #[error("`{0}` is a key, not a directory")]
    IsKey(String),

    /// The source refused the operation.
    #[error("permission denied: {0}")]
    NoPermission(String),

    /// No source in the chain accepts writes for the key.
    #[error("no writable source can store a value at `{0}`")]
    NoWritableDatabase(String),

    /// The daemon is shutting down and rejects mutations.
    #[error("the configuration server is shutting down")]
    InShutdown,

    /// Another daemon instance holds the instance lock.
    #[error("failed to acquire lock: {0}")]
    LockFailed(String),

    /// A read-only source earlier in the chain already holds a value.
    #[error("value for `{0}` is set in a read-only source at the front of the path")]
    Overridden(String),

    /// Anything else.
    #[error("{0}")]
    Failed(String),
}

/// Result type for configuration operations.
pub type ConfResult<T> = Result<T, ConfError>;

/// Wire-level classification of a [`ConfError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadKey,
    BadAddress,
    ParseError,
    Corrupt,
    TypeMismatch,
    IsDir,
    IsKey,
    NoPermission,
    NoWritableDatabase,
    InShutdown,
    LockFailed,
    Overridden,
    Failed,
}

impl ConfError {
    /// Create a bad key error.
    pub fn bad_key(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadKey {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a bad address error.
    pub fn bad_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Map an I/O failure from a source onto the closest error kind.
    pub fn from_io(context: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Self::NoPermission(format!("{}: {}", context, err))
            }
            _ => Self::Failed(format!("{}: {}", context, err)),
        }
    }

    /// The wire classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfError::BadKey { .. } => ErrorKind::BadKey,
            ConfError::BadAddress { .. } => ErrorKind::BadAddress,
            ConfError::ParseError(_) => ErrorKind::ParseError,
            ConfError::Corrupt(_) => ErrorKind::Corrupt,
            ConfError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            ConfError::IsDir(_) => ErrorKind::IsDir,
            ConfError::IsKey(_) => ErrorKind::IsKey,
            ConfError::NoPermission(_) => ErrorKind::NoPermission,
            ConfError::NoWritableDatabase(_) => ErrorKind::NoWritableDatabase,
            ConfError::InShutdown => ErrorKind::InShutdown,
            ConfError::LockFailed(_) => ErrorKind::LockFailed,
            ConfError::Overridden(_) => ErrorKind::Overridden,
            ConfError::Failed(_) => ErrorKind::Failed,
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::BadKey => Self::BadKey {
                key: String::new(),
                reason: message,
            },
            ErrorKind::BadAddress => Self::BadAddress {
                address: String::new(),
                reason: message,
            },
            ErrorKind::ParseError => Self::ParseError(message),
            ErrorKind::Corrupt => Self::Corrupt(message),
            ErrorKind::TypeMismatch => Self::TypeMismatch(message),
            ErrorKind::IsDir => Self::IsDir(message),
            ErrorKind::IsKey => Self::IsKey(message),
            ErrorKind::NoPermission => Self::NoPermission(message),
            ErrorKind::NoWritableDatabase => Self::NoWritableDatabase(message),
            ErrorKind::InShutdown => Self::InShutdown,
            ErrorKind::LockFailed => Self::LockFailed(message),
            ErrorKind::Overridden => Self::Overridden(message),
            ErrorKind::Failed => Self::Failed(message),
        }
    }
}
