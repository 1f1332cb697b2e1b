//! Pre-flight destination validation.
//!
//! Before a destination goes live (and on demand from the admin surface),
//! the validator exercises the minimum side effect of each capability
//! against a freshly derived temporary namespace/table and reports the
//! first observed error verbatim. Temporary state is cleaned up on both
//! success and failure paths: probe tables carry the staging prefix so
//! [`WarehouseDriver::cleanup`] drops them, and probe objects are deleted
//! explicitly.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ulid::Ulid;

use wharf_core::id::{SourceId, WorkspaceId};
use wharf_core::schema::{DataType, TableSchema};
use wharf_core::storage::{ObjectStore, WritePrecondition};
use wharf_core::warehouse::{Destination, Source, Warehouse};

use crate::driver::{DriverError, ErrorKind, LoadFile, Result, Uploader, WarehouseDriver};
use crate::loadfile::write_csv_gz;
use crate::postgres::STAGING_TABLE_PREFIX;
use crate::registry::DriverRegistry;
use crate::values::ColumnValue;

/// Prefix for validation payload objects.
const PAYLOAD_PREFIX: &str = "rudder-test-payload";

/// The probes a destination can be validated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationKind {
    /// Write, read back and delete a payload object.
    ObjectStorage,
    /// Open a connection and ping.
    Connections,
    /// Create the namespace.
    CreateSchema,
    /// Create a probe table, then alter it.
    CreateAndAlterTable,
    /// Read the remote schema.
    FetchSchema,
    /// Load a probe table with one synthetic row.
    LoadTable,
}

impl ValidationKind {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::ObjectStorage => "object_storage",
            Self::Connections => "connections",
            Self::CreateSchema => "create_schema",
            Self::CreateAndAlterTable => "create_and_alter_table",
            Self::FetchSchema => "fetch_schema",
            Self::LoadTable => "load_table",
        }
    }
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Uploader fixture pointing drivers at the validation payload.
struct ValidationUploader {
    files: HashMap<String, Vec<LoadFile>>,
    schema: TableSchema,
}

#[async_trait]
impl Uploader for ValidationUploader {
    fn use_rudder_storage(&self) -> bool {
        false
    }

    async fn load_files(&self, table: &str) -> Result<Vec<LoadFile>> {
        Ok(self.files.get(table).cloned().unwrap_or_default())
    }

    fn schema_in_upload(&self, _table: &str) -> TableSchema {
        self.schema.clone()
    }

    fn schema_in_warehouse(&self, _table: &str) -> TableSchema {
        self.schema.clone()
    }
}

/// One destination validation.
pub struct Validator {
    kind: ValidationKind,
    warehouse: Warehouse,
    table: String,
    payload_key: String,
}

impl Validator {
    /// Creates a validator for one probe against the destination.
    ///
    /// The probe table and payload object names are freshly derived per
    /// validator, so concurrent validations never collide.
    #[must_use]
    pub fn new(kind: ValidationKind, destination: &Destination) -> Self {
        let suffix = Ulid::new().to_string().to_lowercase();
        let namespace = destination
            .config
            .namespace()
            .map_or_else(|| format!("setup_test_{suffix}"), str::to_string);

        let warehouse = Warehouse {
            source: Source {
                id: SourceId::new("validation"),
                name: "validation".into(),
                enabled: true,
            },
            destination: destination.clone(),
            workspace_id: WorkspaceId::new("validation"),
            namespace,
        };

        Self {
            kind,
            warehouse,
            table: format!("{STAGING_TABLE_PREFIX}setup_test_{suffix}"),
            payload_key: format!("{PAYLOAD_PREFIX}/{suffix}/load.csv.gz"),
        }
    }

    /// The probe this validator runs.
    #[must_use]
    pub const fn kind(&self) -> ValidationKind {
        self.kind
    }

    /// Runs the probe, cleaning up on both success and failure paths.
    ///
    /// # Errors
    ///
    /// Returns the first observed error verbatim.
    pub async fn validate(
        &self,
        registry: &dyn DriverRegistry,
        storage: Arc<dyn ObjectStore>,
    ) -> Result<()> {
        if self.kind == ValidationKind::ObjectStorage {
            return self.verify_object_storage(&storage).await;
        }

        let schema = probe_schema();
        let uploader = Arc::new(ValidationUploader {
            files: HashMap::from([(
                self.table.clone(),
                vec![LoadFile {
                    location: self.payload_key.clone(),
                    total_rows: None,
                }],
            )]),
            schema: schema.clone(),
        });
        let driver = registry.driver_for(&self.warehouse, uploader)?;

        let result = self.run_probe(driver.as_ref(), &storage, &schema).await;

        // Cleanup runs on both paths; its own failures never mask the
        // probe's result.
        let _ = driver.cleanup().await;
        let _ = storage.delete(&self.payload_key).await;

        result
    }

    async fn run_probe(
        &self,
        driver: &dyn WarehouseDriver,
        storage: &Arc<dyn ObjectStore>,
        schema: &TableSchema,
    ) -> Result<()> {
        driver.connect().await?;
        if self.kind == ValidationKind::Connections {
            return Ok(());
        }

        driver.create_schema().await?;
        if self.kind == ValidationKind::CreateSchema {
            return Ok(());
        }

        if self.kind == ValidationKind::FetchSchema {
            driver.fetch_schema().await?;
            return Ok(());
        }

        driver.create_table(&self.table, schema).await?;
        let alteration = TableSchema::new().with_column("alter_test", DataType::Datetime);
        driver.alter_table(&self.table, &alteration).await?;
        if self.kind == ValidationKind::CreateAndAlterTable {
            return Ok(());
        }

        // LoadTable: stage one synthetic row and load it.
        let row = vec![
            ColumnValue::String(Ulid::new().to_string()),
            ColumnValue::Int(1),
        ];
        let body = write_csv_gz(&[row])?;
        storage
            .put(&self.payload_key, Bytes::from(body), WritePrecondition::None)
            .await?;

        let stats = driver.load_table(&self.table).await?;
        if stats.rows_inserted != 1 {
            return Err(DriverError::new(
                ErrorKind::Fatal,
                format!(
                    "load table: expected 1 inserted row, got {}",
                    stats.rows_inserted
                ),
            ));
        }
        Ok(())
    }

    async fn verify_object_storage(&self, storage: &Arc<dyn ObjectStore>) -> Result<()> {
        let body = Bytes::from(write_csv_gz(&[vec![ColumnValue::Int(1)]])?);
        storage
            .put(&self.payload_key, body.clone(), WritePrecondition::None)
            .await?;

        let result = async {
            let read = storage.get(&self.payload_key).await?;
            if read != body {
                return Err(DriverError::new(
                    ErrorKind::Fatal,
                    "uploading test payload: downloaded content differs",
                ));
            }
            Ok(())
        }
        .await;

        let _ = storage.delete(&self.payload_key).await;
        result
    }
}

/// Columns of the probe table: one synthetic key and one value.
fn probe_schema() -> TableSchema {
    TableSchema::new()
        .with_column("id", DataType::String)
        .with_column("val", DataType::Int)
}
