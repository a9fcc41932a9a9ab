//! Error types for stage-lineage
//!
//! Every error carries enough context to tell the operator which stage,
//! node or configuration entry is at fault. [`Error::kind`] maps each
//! variant onto the terminal state a stage execution ends in.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// How an error terminates a stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No stage may run (bad registry, unreachable or corrupt ledger).
    Fatal,
    /// Aborted before any computation or commit, with no side effects.
    Rejected,
    /// Aborted during or after computation; safe to retry under the same id.
    Failed,
}

/// stage-lineage error types
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid registry or driver configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stage type is not registered
    #[error("Unknown stage type: {stage}")]
    UnknownStage {
        /// The stage type that was looked up
        stage: String,
    },

    /// A node with this id is already committed
    #[error("Experiment '{id}' already exists in the ledger")]
    DuplicateId {
        /// The conflicting node id
        id: String,
    },

    /// Node lookup failed
    #[error("Experiment '{id}' not found")]
    NotFound {
        /// The missing node id
        id: String,
    },

    /// Catalog document lookup failed
    #[error("No document in '{collection}' matches {key}")]
    DocumentNotFound {
        /// Collection that was searched
        collection: String,
        /// Human-readable description of the lookup key
        key: String,
    },

    /// The referenced parent node does not exist (yet)
    #[error("Parent experiment '{parent}' not found - it may not have finished executing")]
    ParentNotFound {
        /// The parent id supplied by the launcher
        parent: String,
    },

    /// A non-root stage was launched without a parent reference
    #[error("Stage '{stage}' requires a parent experiment but none was given")]
    MissingParent {
        /// Stage being executed
        stage: String,
    },

    /// The parent node is of the wrong stage type
    #[error("Stage '{stage}' requires a parent of type '{expected}', but '{parent}' is '{actual}'")]
    ParentTypeMismatch {
        /// Stage being executed
        stage: String,
        /// Parent id supplied by the launcher
        parent: String,
        /// Required parent stage type
        expected: String,
        /// Stage type of the supplied parent
        actual: String,
    },

    /// A root stage was launched with a parent reference
    #[error("Stage '{stage}' is a root stage but was given parent '{parent}'")]
    UnexpectedParent {
        /// Stage being executed
        stage: String,
        /// Parent id supplied by the launcher
        parent: String,
    },

    /// No ancestor of the requested stage type exists
    #[error("No ancestor of type '{target}' found in the lineage of '{start}'")]
    LineageNotFound {
        /// Node the search started from
        start: String,
        /// Stage type that was searched for
        target: String,
    },

    /// A parameter required by the stage is absent
    #[error("Stage '{stage}' requires parameter '{key}'")]
    MissingParameter {
        /// Stage being executed
        stage: String,
        /// Missing parameter key
        key: String,
    },

    /// A parameter is present but does not have the expected shape
    #[error("Parameter '{key}' is invalid: {message}")]
    InvalidParameter {
        /// Parameter key
        key: String,
        /// Why the value was rejected
        message: String,
    },

    /// Output roots must be absolute so committed paths are unambiguous
    #[error("Output root must be an absolute path: {path}")]
    InvalidOutputRoot {
        /// The rejected root
        path: String,
    },

    /// The external computation failed
    #[error("Computation for stage '{stage}' failed: {source}")]
    ComputationFailure {
        /// Stage being executed
        stage: String,
        /// Opaque collaborator error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The ledger cannot be reached
    #[error("Ledger storage unavailable: {0}")]
    StorageUnavailable(String),

    /// The ledger contents violate lineage invariants
    #[error("Corrupt ledger: {0}")]
    CorruptLedger(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an opaque collaborator failure.
    pub fn computation(
        stage: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::ComputationFailure {
            stage: stage.into(),
            source: source.into(),
        }
    }

    /// Classify the error by the terminal state it produces.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::StorageUnavailable(_) | Self::CorruptLedger(_) => {
                ErrorKind::Fatal
            }
            Self::UnknownStage { .. }
            | Self::NotFound { .. }
            | Self::DocumentNotFound { .. }
            | Self::ParentNotFound { .. }
            | Self::MissingParent { .. }
            | Self::ParentTypeMismatch { .. }
            | Self::UnexpectedParent { .. }
            | Self::LineageNotFound { .. }
            | Self::MissingParameter { .. }
            | Self::InvalidParameter { .. }
            | Self::InvalidOutputRoot { .. } => ErrorKind::Rejected,
            Self::DuplicateId { .. }
            | Self::ComputationFailure { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Failed,
        }
    }

    /// True for errors that must stop the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal)
    }
}
