//! # wharf-core
//!
//! Core abstractions for the Wharf warehouse ingestion platform.
//!
//! This crate provides the foundational types shared by all Wharf components:
//!
//! - **Identifiers**: Strongly-typed ids for sources, destinations, uploads
//!   and staging files
//! - **Schema Model**: The logical table/column type model and its additive
//!   merge rules
//! - **Warehouse Model**: Destination configuration and the warehouse
//!   identity triple
//! - **Object Storage**: The storage contract used for staging files, load
//!   files and coordination
//! - **Advisory Lock**: CAS-based multi-process exclusion for upload creation
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `wharf-core` is the only crate allowed to define shared primitives. The
//! driver layer (`wharf-warehouse`) and the control plane (`wharf-flow`)
//! interact exclusively through the contracts defined here.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod lock;
pub mod observability;
pub mod paths;
pub mod schema;
pub mod storage;
pub mod warehouse;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use wharf_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{BatchId, DestinationId, SourceId, StagingFileId, UploadId, WorkspaceId};
    pub use crate::lock::{AdvisoryLock, LockGuard, LockInfo};
    pub use crate::schema::{DataType, Schema, SchemaDiff, TableSchema};
    pub use crate::storage::{
        MemoryObjectStore, ObjectMeta, ObjectStore, WritePrecondition, WriteResult,
    };
    pub use crate::warehouse::{Destination, DestinationConfig, DestinationType, Source, Warehouse};
}

// Re-export key types at crate root for ergonomics.
pub use error::{Error, Result};
pub use id::{BatchId, DestinationId, SourceId, StagingFileId, UploadId, WorkspaceId};
pub use lock::{AdvisoryLock, LockGuard, LockInfo};
pub use observability::{init_logging, LogFormat};
pub use schema::{ColumnConflict, DataType, Schema, SchemaDiff, TableSchema};
pub use storage::{MemoryObjectStore, ObjectMeta, ObjectStore, WritePrecondition, WriteResult};
pub use warehouse::{Destination, DestinationConfig, DestinationType, Source, Warehouse};
