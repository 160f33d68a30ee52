//! Watched Resource Error Hierarchy
//!
//! Errors are split between the resource lifecycle (build, disposal, access
//! after close, initial sync) and the underlying watch source.

use std::time::Duration;

use config::ConfigError;

/// Error type produced by user supplied factories and cleanup consumers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The build factory failed during the first `get()` or a refresh
    #[error("Failed to build resource for {path}: {source}")]
    Build {
        path: String,
        #[source]
        source: BoxError,
    },

    /// Operation attempted after `close()`
    #[error("Resource for {path} has been closed")]
    Closed { path: String },

    /// The cleanup predicate panicked or gave up
    #[error("Failed to dispose resource for {path}: {reason}")]
    Disposal { path: String, reason: String },

    /// Initial subtree sync did not arrive in time
    #[error("Initial sync of {path} not completed after {timeout:?}")]
    InitTimeout { path: String, timeout: Duration },

    /// Watch source failures
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Notification thread spawn failures
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Configuration loading and validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Node {path} does not exist")]
    NoNode { path: String },

    #[error("Node {path} already exists")]
    NodeExists { path: String },

    #[error("Node {path} has children")]
    NotEmpty { path: String },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Watch on {path} has been closed")]
    Closed { path: String },
}

impl Error {
    pub(crate) fn closed(path: &str) -> Self {
        Error::Closed {
            path: path.to_string(),
        }
    }

    pub(crate) fn build(
        path: &str,
        source: BoxError,
    ) -> Self {
        Error::Build {
            path: path.to_string(),
            source,
        }
    }

    pub(crate) fn disposal(
        path: &str,
        reason: impl Into<String>,
    ) -> Self {
        Error::Disposal {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// True when the error is the "already closed" condition
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed { .. })
    }
}

/// Render a panic payload caught at a task or callback boundary
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
