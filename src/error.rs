//! Top-level error types for NanoClaw.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Registered-group / message-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("group not found: {jid}")]
    GroupNotFound { jid: String },

    #[error("folder '{folder}' already in use by group {jid}")]
    FolderConflict { folder: String, jid: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Backend (container / sandbox / ephemeral VM) errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("failed to spawn agent substrate: {0}")]
    Spawn(String),

    #[error("agent session timed out")]
    Timeout,

    #[error("agent exited with non-zero status and no stream output")]
    NonZeroExit,

    #[error("agent was killed")]
    Killed,

    #[error("backend '{0}' not registered")]
    UnknownBackend(String),

    #[error("substrate could not be initialized: {0}")]
    InitFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// IPC plane errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("path '{path}' escapes group workspace root '{root}'")]
    PathTraversal { path: String, root: String },

    #[error("task rejected: {reason}")]
    TaskRejected { reason: String },

    #[error("message reference validation failed: {reason}")]
    ReferenceValidation { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scheduler / group queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("group {jid} has no registered process function")]
    NoProcessFn { jid: String },

    #[error("retries exhausted for group {jid}")]
    Exhausted { jid: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Channel adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("no channel owns jid '{0}'")]
    NoOwner(String),

    #[error("channel '{channel}' send failed: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("circuit breaker open for channel '{0}'")]
    BreakerOpen(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
