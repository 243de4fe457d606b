//! Error types for the stowage engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All errors that can occur while configuring or executing a job.
#[derive(Debug, Error)]
pub enum EngineError {
    /// I/O failure with the operation and path that triggered it.
    #[error("I/O error during {operation} on {}: {source}", path.display())]
    Io {
        /// Operation that failed.
        operation: &'static str,
        /// Path involved in the failure.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// I/O failure on a stream with no filesystem path attached.
    #[error("stream error: {0}")]
    Stream(#[from] std::io::Error),

    /// No backend constructor is registered under this name.
    #[error("unknown backend: {name}")]
    UnknownBackend {
        /// Requested backend name.
        name: String,
    },

    /// No transform constructor is registered under this name.
    #[error("unknown transform: {name}")]
    UnknownTransform {
        /// Requested transform name.
        name: String,
    },

    /// A component rejected its options.
    #[error("invalid option {key} for {component}: {reason}")]
    InvalidOption {
        /// Backend or transform name.
        component: String,
        /// Option key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The job definition is incomplete or inconsistent for its kind.
    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    /// A backend failed to answer whether it wants an item.
    #[error("backend {backend} participation check failed: {msg}")]
    Participation {
        /// Backend name.
        backend: String,
        /// Error message.
        msg: String,
    },

    /// A transform stage failed while processing a stream.
    #[error("transform {stage} failed: {msg}")]
    Stage {
        /// Transform name.
        stage: String,
        /// Error message.
        msg: String,
    },

    /// A backend failed while consuming or retrieving a stream.
    #[error("backend {backend} failed: {msg}")]
    Sink {
        /// Backend name.
        backend: String,
        /// Error message.
        msg: String,
    },

    /// The operation is not supported by this backend.
    #[error("backend {backend} does not support {operation}")]
    Unsupported {
        /// Backend name.
        backend: String,
        /// Unsupported operation.
        operation: &'static str,
    },

    /// Restored bytes do not hash to the signature's content hash.
    #[error("content hash mismatch: expected {expected}, restored {actual}")]
    Integrity {
        /// Hash recorded at backup time.
        expected: String,
        /// Hash of the bytes that came out of the restore chain.
        actual: String,
    },

    /// Walking a backup root failed.
    #[error("walk error at {}: {msg}", path.display())]
    Walk {
        /// Path where the walk failed.
        path: PathBuf,
        /// Error message.
        msg: String,
    },

    /// A job with this ID is already registered.
    #[error("job already active: {0}")]
    JobExists(String),

    /// No job with this ID is registered.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// The job is not in a state that allows the requested transition.
    #[error("job {job_id} cannot {action} from state {state}")]
    InvalidState {
        /// Job identifier.
        job_id: String,
        /// Attempted action.
        action: &'static str,
        /// Current state.
        state: String,
    },

    /// The work queue was aborted or closed before the item was accepted.
    #[error("work queue closed")]
    QueueClosed,

    /// A spawned job or sink task panicked or was aborted.
    #[error("task failed: {0}")]
    Join(String),
}

impl EngineError {
    /// Wrap an I/O error with the operation and path that produced it.
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Classify this error for per-item outcome reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Io { .. } | EngineError::Stream(_) => ErrorKind::Io,
            EngineError::UnknownBackend { .. }
            | EngineError::UnknownTransform { .. }
            | EngineError::InvalidOption { .. }
            | EngineError::InvalidDefinition(_) => ErrorKind::Configuration,
            EngineError::Participation { .. } => ErrorKind::Participation,
            EngineError::Stage { .. } => ErrorKind::Transform,
            EngineError::Sink { .. } | EngineError::Unsupported { .. } => ErrorKind::Backend,
            EngineError::Integrity { .. } => ErrorKind::Integrity,
            EngineError::Walk { .. } => ErrorKind::Discovery,
            EngineError::JobExists(_)
            | EngineError::JobNotFound(_)
            | EngineError::InvalidState { .. }
            | EngineError::QueueClosed
            | EngineError::Join(_) => ErrorKind::Job,
        }
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Broad category of a per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Filesystem or stream I/O.
    Io,
    /// Bad option, unknown component or inconsistent definition.
    Configuration,
    /// A backend's participation check failed.
    Participation,
    /// A transform stage failed.
    Transform,
    /// A backend failed to consume or retrieve.
    Backend,
    /// Restored content did not match its recorded hash.
    Integrity,
    /// The file-tree walk failed.
    Discovery,
    /// Job lifecycle misuse.
    Job,
}

/// Structured, serialisable error attached to a per-item outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeError {
    /// Error category.
    pub kind: ErrorKind,
    /// Human readable message.
    pub message: String,
}

impl From<&EngineError> for OutcomeError {
    fn from(err: &EngineError) -> Self {
        OutcomeError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<EngineError> for OutcomeError {
    fn from(err: EngineError) -> Self {
        OutcomeError::from(&err)
    }
}

impl std::fmt::Display for OutcomeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
