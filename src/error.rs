//! Error types
//!
//! `StorageError` covers the local block store; `FsError` is the taxonomy every
//! core operation returns to the filesystem-callback boundary and to RPC callers.

use crate::types::Hash;
use thiserror::Error;

/// Errors raised by the local block store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("blob digest mismatch: expected {}, got {}", hex::encode(.expected), hex::encode(.actual))]
    Corrupt { expected: Hash, actual: Hash },
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Filesystem and replication error taxonomy
#[derive(Debug, Error)]
pub enum FsError {
    /// Missing name or hash, locally and remotely
    #[error("not found: {0}")]
    NotFound(String),

    /// Mutation attempted on an archived or historical subtree
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// HMAC mismatch or RSA decrypt failure
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// Peer unreachable after bounded dial retries
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Corrupt blob on decode
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    /// No token grant within the retry budget in strong-consistency mode
    #[error("token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl FsError {
    /// POSIX errno the callback adapter reports for this error
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => 2,              // ENOENT
            FsError::PermissionDenied(_) => 1,      // EPERM
            FsError::AlreadyExists(_) => 17,        // EEXIST
            FsError::InvalidOperation(_) => 22,     // EINVAL
            FsError::AuthenticationFailure(_) => 13, // EACCES
            FsError::TokenUnavailable(_) => 13,
            FsError::RemoteUnavailable(_)
            | FsError::SerializationFailure(_)
            | FsError::Storage(_)
            | FsError::Config(_) => 5, // EIO
        }
    }

    /// Whether a failed remote call should be treated as "peer lacks the data"
    pub fn is_remote_miss(&self) -> bool {
        matches!(self, FsError::NotFound(_) | FsError::RemoteUnavailable(_))
    }
}

impl From<config::ConfigError> for FsError {
    fn from(err: config::ConfigError) -> Self {
        FsError::Config(err.to_string())
    }
}

/// Socket-level failures: the peer is treated as unreachable
impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::RemoteUnavailable(err.to_string())
    }
}

impl From<bincode::Error> for FsError {
    fn from(err: bincode::Error) -> Self {
        FsError::SerializationFailure(err.to_string())
    }
}
