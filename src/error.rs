use std::io;
use thiserror::Error;

/// Errors surfaced by a synchronization run.
///
/// An unreachable host, rejected credentials and a transfer that broke
/// halfway each have their own variant.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Host {host}:{port} unreachable: {reason}")]
    Unreachable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Integrity check failed for container {container_id}: expected {expected} bytes, received {actual}")]
    Integrity {
        container_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Remote error ({code:?}): {message}")]
    Remote {
        code: crate::protocol::ErrorCode,
        message: String,
    },

    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        SyncError::ProtocolViolation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        SyncError::Storage(msg.into())
    }

    /// Convert a socket-level failure into a transport error.
    ///
    /// Mid-transfer I/O is always reported as `Transport`, never as the
    /// generic `Io` kind, so callers can tell it apart from local disk errors.
    pub fn transport(err: io::Error) -> Self {
        SyncError::Transport(err.to_string())
    }

    /// Wire code used when this error is reported to the peer.
    pub fn code(&self) -> crate::protocol::ErrorCode {
        use crate::protocol::ErrorCode;
        match self {
            SyncError::Authentication(_) => ErrorCode::AuthenticationFailed,
            SyncError::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            SyncError::Integrity { .. } => ErrorCode::IntegrityFailed,
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::Storage(_) | SyncError::Io(_) | SyncError::Json(_) => ErrorCode::StorageFailed,
            SyncError::Remote { code, .. } => *code,
            SyncError::Unreachable { .. } | SyncError::Transport(_) | SyncError::Config(_) => {
                ErrorCode::Internal
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
