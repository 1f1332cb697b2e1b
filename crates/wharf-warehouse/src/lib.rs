//! # wharf-warehouse
//!
//! The warehouse driver layer of the Wharf ingestion platform.
//!
//! This crate defines the capability contract every destination type
//! implements, and provides:
//!
//! - **Driver Interface**: [`driver::WarehouseDriver`], the polymorphic
//!   capability set (schema DDL, schema fetch, merge loads, cleanup)
//! - **Column Values**: destination-aware parsing and coercion of raw
//!   column values into logical types
//! - **Load Files**: per-table CSV load-file generation from staged event
//!   batches, with discard routing for rejected values
//! - **Reference Drivers**: PostgreSQL (SQL warehouse, merge-by-id) and
//!   S3-style datalake (object store, append-only)
//! - **Validator**: pre-flight destination probes (storage, connectivity,
//!   DDL privileges, schema fetch, load)
//!
//! ## Guarantees
//!
//! - Schema DDL is idempotent (`IF NOT EXISTS` everywhere)
//! - `load_table` is re-runnable without duplicating committed rows
//! - Every driver error carries a taxonomy kind that the upload state
//!   machine uses to decide retry vs abort

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod datalake;
pub mod discards;
pub mod driver;
pub mod loadfile;
pub mod postgres;
pub mod registry;
pub mod validator;
pub mod values;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::datalake::DatalakeDriver;
    pub use crate::discards::{discards_schema, DiscardRow, DISCARDS_TABLE};
    pub use crate::driver::{
        DriverError, ErrorKind, LoadFile, LoadTableStats, Result, Uploader, WarehouseDriver,
    };
    pub use crate::loadfile::{GeneratedLoadFiles, LoadFileGenerator, TableLoadFiles};
    pub use crate::postgres::PostgresDriver;
    pub use crate::registry::{DriverRegistry, StaticDriverRegistry};
    pub use crate::validator::{ValidationKind, Validator};
    pub use crate::values::{process_column_value, ColumnValue, StringPolicy};
}

pub use driver::{DriverError, ErrorKind, LoadFile, LoadTableStats, Uploader, WarehouseDriver};
pub use registry::{DriverRegistry, StaticDriverRegistry};
