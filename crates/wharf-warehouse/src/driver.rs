//! The warehouse driver capability contract.
//!
//! Every destination type (Postgres, MSSQL, Snowflake, BigQuery, Redshift,
//! Databricks, S3 datalake, ...) implements [`WarehouseDriver`]. The upload
//! state machine depends on nothing below this trait; drivers depend on
//! nothing above it. Drivers pull the upload's load files and schemas
//! through the [`Uploader`] collaborator rather than holding references
//! into the control plane.
//!
//! ## Cancellation
//!
//! Every method is a plain future: callers impose deadlines with
//! `tokio::time::timeout` and cancellation by dropping the future. Drivers
//! must keep each method safe to abandon between statements; the
//! re-runnability guarantees below make abandoned work harmless.
//!
//! ## Idempotence
//!
//! - `create_schema` / `create_table` / `alter_table` are no-ops when the
//!   object already exists
//! - `load_table` merges by `id` for dedupable tables and must be
//!   re-runnable without duplicating committed rows

use std::fmt;

use async_trait::async_trait;

use wharf_core::schema::{Schema, TableSchema};
use wharf_core::warehouse::DestinationType;

/// The result type used throughout the driver layer.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Name of the identity-merge-rules table, loaded before user tables.
pub const IDENTITY_MERGE_RULES_TABLE: &str = "rudder_identity_merge_rules";

/// Name of the identities table, loaded before dependent fact tables.
pub const IDENTIFIES_TABLE: &str = "identifies";

/// Name of the users table, loaded before dependent fact tables.
pub const USERS_TABLE: &str = "users";

/// Error taxonomy the upload state machine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network, timeout, DB serialization failure. Retried with backoff
    /// within the same phase.
    Transient,
    /// Missing privileges. Not retried; only operator action can resolve
    /// it, so the upload aborts with the error surfaced verbatim.
    Permissions,
    /// Logical type mismatch between upload and remote schema. The
    /// affected table aborts; other tables proceed.
    SchemaConflict,
    /// A row failed column-value validation. Routed to the discards table;
    /// never fails the upload.
    DataQuality,
    /// Malformed configuration or a destination disabled mid-run. Aborts
    /// the upload and suppresses re-scheduling until the config changes.
    Fatal,
}

impl ErrorKind {
    /// Returns true if the state machine should retry this kind.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permissions => "permissions",
            Self::SchemaConflict => "schema_conflict",
            Self::DataQuality => "data_quality",
            Self::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// A driver-layer error: a taxonomy kind plus the message surfaced to
/// operators.
///
/// The message is preserved verbatim through retries and into the upload's
/// error history, so drivers format it exactly once, in the wire form the
/// destination's operators recognize (for Postgres: `pq: <server message>`
/// prefixed by the failing operation).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    kind: ErrorKind,
    message: String,
}

impl DriverError {
    /// Creates a new driver error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates an error whose message is prefixed by the failing operation,
    /// e.g. `create table: pq: permission denied for schema analytics`.
    #[must_use]
    pub fn in_operation(kind: ErrorKind, operation: &str, message: impl fmt::Display) -> Self {
        Self {
            kind,
            message: format!("{operation}: {message}"),
        }
    }

    /// Returns the taxonomy kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if the state machine should retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<wharf_core::Error> for DriverError {
    fn from(err: wharf_core::Error) -> Self {
        use wharf_core::Error as E;
        let kind = match &err {
            E::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            E::InvalidConfig { .. } | E::InvalidId { .. } => ErrorKind::Fatal,
            E::Serialization { .. } | E::InvalidInput(_) | E::Internal { .. } => ErrorKind::Fatal,
            E::Storage { .. } | E::NotFound(_) | E::PreconditionFailed { .. } => {
                ErrorKind::Transient
            }
        };
        Self::new(kind, err.to_string())
    }
}

/// Structured result of one `load_table` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadTableStats {
    /// Rows inserted into the destination table.
    pub rows_inserted: i64,
    /// Rows updated by primary-key match.
    ///
    /// Semantics are driver-specific (MERGE counters differ across
    /// warehouses); each driver documents its mapping.
    pub rows_updated: i64,
}

/// Location of one load file, resolved by the uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFile {
    /// Object-storage key of the file.
    pub location: String,
    /// Row count, when the generator recorded it.
    pub total_rows: Option<i64>,
}

/// The collaborator through which drivers see the upload being loaded.
///
/// Implemented by the upload runner for real uploads and by small fixtures
/// in driver tests and the validator.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Whether load files live in the platform-managed bucket rather than
    /// the customer's.
    fn use_rudder_storage(&self) -> bool;

    /// Resolved load files for one table.
    async fn load_files(&self, table: &str) -> Result<Vec<LoadFile>>;

    /// The upload-time schema snapshot of one table.
    fn schema_in_upload(&self, table: &str) -> TableSchema;

    /// The reconciled warehouse schema of one table.
    fn schema_in_warehouse(&self, table: &str) -> TableSchema;
}

/// The capability set every destination type implements.
#[async_trait]
pub trait WarehouseDriver: Send + Sync {
    /// The destination type this driver serves.
    fn destination_type(&self) -> DestinationType;

    /// Verifies connectivity, e.g. by pinging the warehouse.
    async fn connect(&self) -> Result<()>;

    /// Creates the target namespace (schema). Idempotent.
    async fn create_schema(&self) -> Result<()>;

    /// Creates a table with the given columns. Idempotent.
    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()>;

    /// Adds columns to an existing table. Additive only: a logical type
    /// change surfaces as a [`ErrorKind::SchemaConflict`] error.
    async fn alter_table(&self, table: &str, add_columns: &TableSchema) -> Result<()>;

    /// Reads the namespace's current schema from the destination's catalog.
    ///
    /// Per-upload staging helper tables are excluded; the discards table is
    /// reported like any other table.
    async fn fetch_schema(&self) -> Result<Schema>;

    /// Loads one table from its load files: bulk-copies into a staging
    /// area, then merges into the destination table by `id` (dedupable
    /// tables) or appends (event tables).
    async fn load_table(&self, table: &str) -> Result<LoadTableStats>;

    /// Loads the identity-merge-rules table.
    ///
    /// Destinations without special identity handling load it like any
    /// other table.
    async fn load_identity_merge_rules_table(&self) -> Result<LoadTableStats> {
        self.load_table(IDENTITY_MERGE_RULES_TABLE).await
    }

    /// Drops any per-upload staging tables left behind by interrupted
    /// loads. Idempotent.
    async fn cleanup(&self) -> Result<()>;
}
