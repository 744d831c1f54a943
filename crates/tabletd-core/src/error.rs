//! Error types for tablet operations
//!
//! A single error enum spans the workspace. Variants map to the error kinds
//! callers branch on: a backup engine retries nothing on `FailedPrecondition`,
//! a vstream consumer reconnects on `Unavailable`, a health subscriber
//! re-subscribes on `ResourceExhausted`.

use thiserror::Error;

/// Classification of an error, used by callers for control-flow decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation's cancellation token fired.
    Cancelled,
    /// The request was valid but the system is not in a state to serve it
    /// (wrong GTID flavor, replica not configured, ...).
    FailedPrecondition,
    /// A referenced object does not exist (manifest, historical schema, ...).
    NotFound,
    /// The serving component is shutting down or not yet open.
    Unavailable,
    /// A bounded buffer overflowed.
    ResourceExhausted,
    /// An internal invariant was violated (hash mismatch, corrupt event).
    Internal,
    /// The input is valid but the feature is not supported
    /// (minimal binlog row image, unknown compression engine).
    Unsupported,
    /// Anything else.
    Unknown,
}

/// Workspace-wide error type.
#[derive(Error, Debug)]
pub enum TabletError {
    /// Operation cancelled via its cancellation token
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Precondition not met
    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    /// Missing object
    #[error("not found: {0}")]
    NotFound(String),

    /// Component shutting down or closed
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Bounded buffer overflow
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Violated internal invariant
    #[error("internal error: {0}")]
    Internal(String),

    /// Unsupported input or mode
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Unknown(String),
}

impl TabletError {
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn failed_precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::Internal(_) => ErrorKind::Internal,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::Io(_) | Self::Json(_) | Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Prefix the error message with context, keeping the kind.
    ///
    /// The one-line chained message is what operators see; internal callers
    /// branch on `kind()`.
    pub fn wrap(self, msg: impl std::fmt::Display) -> Self {
        match self {
            Self::Cancelled(m) => Self::Cancelled(format!("{msg}: {m}")),
            Self::FailedPrecondition(m) => Self::FailedPrecondition(format!("{msg}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{msg}: {m}")),
            Self::Unavailable(m) => Self::Unavailable(format!("{msg}: {m}")),
            Self::ResourceExhausted(m) => Self::ResourceExhausted(format!("{msg}: {m}")),
            Self::Internal(m) => Self::Internal(format!("{msg}: {m}")),
            Self::Unsupported(m) => Self::Unsupported(format!("{msg}: {m}")),
            Self::Io(e) => Self::Unknown(format!("{msg}: {e}")),
            Self::Json(e) => Self::Unknown(format!("{msg}: {e}")),
            Self::Unknown(m) => Self::Unknown(format!("{msg}: {m}")),
        }
    }
}

/// Result type for tablet operations
pub type Result<T> = std::result::Result<T, TabletError>;
