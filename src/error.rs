//! Error types for the remote operations toolkit
//!
//! Every fallible operation in this crate returns a [`RemoteError`]. Lower
//! layers never swallow errors; services wrap them with kind-bearing
//! messages so the caller can map a single enum variant to a one-line
//! diagnostic.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for remote operations
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Configuration is missing or malformed
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// SSH authentication failed (key and, if available, password)
    #[error("authentication failed for '{user}@{host}': {message}")]
    AuthFailed {
        user: String,
        host: String,
        message: String,
    },

    /// SSH transport error: connect failure, transport lost, remote refusal
    #[error("connection error to '{host}': {message}")]
    ConnectionError { host: String, message: String },

    /// Chunk transfer, manifest, or verification failure
    #[error("transfer error: {0}")]
    TransferError(String),

    /// File sync item failed (mode mismatch, topology violation, I/O)
    #[error("file sync error: {0}")]
    FileSyncError(String),

    /// Block sync conflict or marker parsing failure
    #[error("block sync error: {0}")]
    BlockSyncError(String),

    /// Script upload/execution failure
    #[error("script execution failed: {0}")]
    ScriptExecutionError(String),

    /// Proxy lifecycle error: already running, port conflict, server refusal
    #[error("proxy error: {0}")]
    ProxyError(String),

    /// An operation exceeded its deadline
    #[error("operation timed out after {0} seconds")]
    Timeout(u64),

    /// Plain I/O error with path context
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Build an [`RemoteError::AuthFailed`]
    pub fn auth(user: impl Into<String>, host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthFailed {
            user: user.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Build a [`RemoteError::ConnectionError`]
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Build an [`RemoteError::Io`] with path context
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// A one-word classification of the error kind, for CLI exit-code mapping
    /// and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "config",
            Self::AuthFailed { .. } => "auth",
            Self::ConnectionError { .. } => "connection",
            Self::TransferError(_) => "transfer",
            Self::FileSyncError(_) => "file_sync",
            Self::BlockSyncError(_) => "block_sync",
            Self::ScriptExecutionError(_) => "script_exec",
            Self::ProxyError(_) => "proxy",
            Self::Timeout(_) => "timeout",
            Self::Io { .. } => "io",
        }
    }

    /// Whether a caller should consider retrying the operation that raised
    /// this error. Connection loss and timeouts are recoverable at the
    /// chunk/connection granularity; everything else is not.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionError { .. } | Self::Timeout(_) | Self::Io { .. }
        )
    }
}

/// Result type alias for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        RemoteError::Io {
            path: PathBuf::new(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::ConfigError(err.to_string())
    }
}

/// Extension trait for adding path context to `std::io::Result`
pub trait IoResultExt<T> {
    /// Attach a path to an I/O error
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| RemoteError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert_eq!(RemoteError::ConfigError("x".into()).kind(), "config");
        assert_eq!(RemoteError::Timeout(5).kind(), "timeout");
    }

    #[test]
    fn recoverability() {
        assert!(RemoteError::Timeout(5).is_recoverable());
        assert!(!RemoteError::ProxyError("already running".into()).is_recoverable());
    }

    #[test]
    fn io_error_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err = RemoteError::io("/tmp/x", io_err);
        match err {
            RemoteError::Io { path, .. } => assert_eq!(path, PathBuf::from("/tmp/x")),
            _ => panic!("wrong variant"),
        }
    }
}
