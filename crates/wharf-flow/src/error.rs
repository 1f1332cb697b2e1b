//! Error types for the upload control plane.

use wharf_core::id::{DestinationId, SourceId, UploadId};
use wharf_warehouse::DriverError;

use crate::upload::UploadStatus;

/// The result type used throughout wharf-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in control-plane operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An upload was not found.
    #[error("upload not found: {id}")]
    UploadNotFound {
        /// The upload id that was looked up.
        id: UploadId,
    },

    /// A non-terminal upload already exists for the pair.
    #[error("an active upload already exists for {source_id}:{destination_id}")]
    ActiveUploadExists {
        /// Source side of the pair.
        source_id: SourceId,
        /// Destination side of the pair.
        destination_id: DestinationId,
    },

    /// A compare-and-set transition found another owner's state.
    #[error("stale upload {id}: expected {expected}, found {actual}")]
    StaleUpload {
        /// The contended upload.
        id: UploadId,
        /// The status this worker expected.
        expected: UploadStatus,
        /// The status actually found.
        actual: UploadStatus,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        /// The current status.
        from: UploadStatus,
        /// The attempted target status.
        to: UploadStatus,
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

    /// An error from wharf-core.
    #[error("core error: {0}")]
    Core(#[from] wharf_core::Error),

    /// An error from the warehouse driver layer.
    #[error("{0}")]
    Warehouse(#[from] DriverError),
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

    /// Returns true if the state machine should retry after this error.
    ///
    /// Driver errors carry their own taxonomy; storage and core errors are
    /// treated as transient; everything else (invalid transitions, stale
    /// CAS, missing rows) indicates a logic or ownership problem that a
    /// retry cannot fix.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Warehouse(err) => err.is_retryable(),
            Self::Storage { .. } | Self::Core(_) => true,
            _ => false,
        }
    }
}
