//! Error types for the event repository domain.

use strand_core::SpanId;

/// The result type used throughout strand-events.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in event repository operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A span-synthesizing operation was called without a run ID.
    #[error("cannot record span event: run ID is missing")]
    MissingRunId,

    /// No incomplete row exists for the span being completed.
    #[error("no incomplete span found: {span_id}")]
    IncompleteSpanNotFound {
        /// The span ID that was looked up.
        span_id: SpanId,
    },

    /// A span row cannot be cancelled because it is not partial.
    #[error("span is not partial and cannot be cancelled: {span_id}")]
    NotPartial {
        /// The span ID of the non-partial row.
        span_id: SpanId,
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

    /// A broker publish or subscribe operation failed.
    #[error("broker error: {message}")]
    Broker {
        /// Description of the broker failure.
        message: String,
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

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new broker error.
    #[must_use]
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker {
            message: message.into(),
        }
    }
}
