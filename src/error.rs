use std::path::PathBuf;

/// Crate-wide error type. Every fallible public function in the core
/// returns `Result<T, HarnessError>` so the failure taxonomy stays a
/// single, closed set instead of leaking per-module error types across
/// component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("schema error at {path}: {reason}")]
    Schema { path: PathBuf, reason: String },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("external call failed after {attempts} attempt(s): {reason}")]
    ExternalTransient { attempts: u32, reason: String },

    #[error("external call rejected permanently: {0}")]
    ExternalPermanent(String),

    #[error("child process error: {0}")]
    ChildProcess(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl HarnessError {
    pub fn schema(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HarnessError::Schema {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn invariant(reason: impl Into<String>) -> Self {
        HarnessError::Invariant(reason.into())
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        HarnessError::Protocol(reason.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        HarnessError::NotFound(what.into())
    }

    /// Whether a caller should retry this error at the integration layer.
    pub fn is_transient(&self) -> bool {
        matches!(self, HarnessError::ExternalTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
