//! Error types for the event ingest and pipeline domain.

use strand_core::PipelineRunId;

/// The result type used throughout strand-pipeline.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ingest and pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A filter configuration was rejected.
    #[error("invalid filter: {message}")]
    InvalidFilter {
        /// Description of what made the filter invalid.
        message: String,
    },

    /// A payload did not satisfy a filter step.
    #[error("Data does not match filter")]
    FilterMismatch,

    /// A pipeline step has an unknown or unsupported type.
    #[error("unsupported step type: {step_type}")]
    UnsupportedStep {
        /// The step type that is not supported.
        step_type: String,
    },

    /// A referenced entity (queue, dispatcher, event, step) was not found.
    #[error("not found: {resource_type} with id {id}")]
    MissingEntity {
        /// The type of entity that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A pipeline run was not found.
    #[error("pipeline run not found: {run_id}")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: PipelineRunId,
    },

    /// A unique constraint was violated.
    #[error("duplicate key: {constraint} ({key})")]
    DuplicateKey {
        /// The constraint that was violated.
        constraint: &'static str,
        /// The conflicting key rendering.
        key: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from strand-core.
    #[error("core error: {0}")]
    Core(#[from] strand_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new invalid filter error.
    #[must_use]
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter {
            message: message.into(),
        }
    }

    /// Creates a new missing entity error.
    #[must_use]
    pub fn missing_entity(resource_type: &'static str, id: impl std::fmt::Display) -> Self {
        Self::MissingEntity {
            resource_type,
            id: id.to_string(),
        }
    }
}
