//! Strongly-typed identifiers for Wharf entities.
//!
//! Two families of identifiers exist:
//!
//! - **Externally assigned** string ids (sources, destinations, workspaces)
//!   carried over from the control-plane configuration.
//! - **Repository assigned** monotonic `i64` ids (uploads, staging files)
//!   whose ordering encodes creation order and is relied on by the
//!   scheduler's batch claiming.
//!
//! Process-unique identifiers (staging batch names, lock holders) use ULIDs,
//! which sort by creation time and need no coordination.
//!
//! # Example
//!
//! ```rust
//! use wharf_core::id::{SourceId, UploadId};
//!
//! let source = SourceId::new("src-42");
//! let upload = UploadId::new(17);
//!
//! // Ids are different types - this won't compile:
//! // let wrong: SourceId = upload;
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new id from the given string.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identifier of an event source, assigned by the control plane.
    SourceId
}

string_id! {
    /// Identifier of a warehouse destination, assigned by the control plane.
    DestinationId
}

string_id! {
    /// Identifier of the workspace owning a (source, destination) pair.
    WorkspaceId
}

macro_rules! row_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Creates an id from a raw repository row id.
            #[must_use]
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Returns the raw row id.
            #[must_use]
            pub const fn get(&self) -> i64 {
                self.0
            }

            /// Returns the id immediately following this one.
            #[must_use]
            pub const fn next(&self) -> Self {
                Self(self.0 + 1)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<i64>().map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid row id '{s}': {e}"),
                })
            }
        }
    };
}

row_id! {
    /// Identifier of an upload row, assigned monotonically by the upload
    /// repository.
    UploadId
}

row_id! {
    /// Identifier of a staging-file metadata row, assigned monotonically by
    /// the staging-file repository.
    ///
    /// Uploads refer to staging files by inclusive id range; monotonicity is
    /// what makes range claiming sound.
    StagingFileId
}

/// Identifier of one staged event batch in object storage.
///
/// Batch ids are ULIDs: lexicographically sortable by creation time and
/// globally unique without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Ulid);

impl BatchId {
    /// Generates a new unique batch id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BatchId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s).map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid batch id '{s}': {e}"),
        })
    }
}
