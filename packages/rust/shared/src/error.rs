//! Error types for ContextSync.
//!
//! Library crates use [`ContextSyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level error type for all ContextSync operations.
#[derive(Debug, thiserror::Error)]
pub enum ContextSyncError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Bad input: unresolvable domain, malformed options, unknown job.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A transient failure that may succeed when retried.
    #[error("transient error: {0}")]
    Transient(String),

    /// An operation exceeded its time budget.
    #[error("timed out after {after_ms}ms: {operation}")]
    Timeout { operation: String, after_ms: u64 },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Capturing a domain's artifacts failed.
    #[error("snapshot of {domain} failed: {message}")]
    Snapshot { domain: String, message: String },

    /// Writing a generated artifact failed after generation.
    #[error("commit of {domain} failed: {message}")]
    Commit { domain: String, message: String },

    /// Restoring a snapshot failed; requires operator attention.
    #[error("rollback of {update_id} failed: {message}")]
    Rollback { update_id: String, message: String },

    /// The job was cancelled by an external request.
    #[error("job cancelled")]
    Cancelled,

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ContextSyncError>;

/// Failure taxonomy used when deciding between retry, partial success, and rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    Validation,
    TransientIo,
    PartialFailure,
    CommitFailure,
    RollbackFailure,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::TransientIo => "transient-io",
            Self::PartialFailure => "partial-failure",
            Self::CommitFailure => "commit-failure",
            Self::RollbackFailure => "rollback-failure",
        };
        f.write_str(s)
    }
}

impl ContextSyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a snapshot error for a domain.
    pub fn snapshot(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Snapshot {
            domain: domain.into(),
            message: msg.into(),
        }
    }

    /// Create a commit error for a domain.
    pub fn commit(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Commit {
            domain: domain.into(),
            message: msg.into(),
        }
    }

    /// Create a rollback error for an update.
    pub fn rollback(update_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Rollback {
            update_id: update_id.into(),
            message: msg.into(),
        }
    }

    /// Whether a stage may retry the failed operation before escalating.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout { .. } => true,
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }

    /// Map this error onto the failure taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config { .. } | Self::Validation { .. } | Self::NotFound(_) => {
                ErrorClass::Validation
            }
            Self::Commit { .. } => ErrorClass::CommitFailure,
            Self::Rollback { .. } => ErrorClass::RollbackFailure,
            Self::Snapshot { .. } | Self::Cancelled => ErrorClass::PartialFailure,
            Self::Io { .. } | Self::Transient(_) | Self::Timeout { .. } | Self::Storage(_) => {
                ErrorClass::TransientIo
            }
        }
    }
}
