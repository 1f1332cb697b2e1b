//! Error types and result aliases for Wharf.
//!
//! This module defines the shared error types used across all Wharf
//! components. Errors are structured for programmatic handling and include
//! context for debugging.

use std::fmt;

use crate::schema::DataType;

/// The result type used throughout Wharf.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Wharf operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the id invalid.
        message: String,
    },

    /// A destination configuration value is missing or malformed.
    #[error("invalid config: {message}")]
    InvalidConfig {
        /// Description of the configuration problem.
        message: String,
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

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// Two schemas disagree on the logical type of a column.
    #[error(
        "schema conflict: column {table}.{column} is {existing} in the warehouse, {incoming} in the upload"
    )]
    SchemaConflict {
        /// Table containing the conflicting column.
        table: String,
        /// The conflicting column.
        column: String,
        /// The type already present in the warehouse.
        existing: DataType,
        /// The type carried by the upload.
        incoming: DataType,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
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

    /// Creates a new invalid-config error.
    #[must_use]
    pub fn invalid_config(message: impl fmt::Display) -> Self {
        Self::InvalidConfig {
            message: message.to_string(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn schema_conflict_display_names_both_types() {
        let err = Error::SchemaConflict {
            table: "tracks".into(),
            column: "revenue".into(),
            existing: DataType::Float,
            incoming: DataType::String,
        };
        let msg = err.to_string();
        assert!(msg.contains("tracks.revenue"));
        assert!(msg.contains("float"));
        assert!(msg.contains("string"));
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "object missing");
        let err = Error::storage_with_source("failed to read staging file", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }
}
