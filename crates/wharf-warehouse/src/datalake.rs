//! S3-style datalake reference driver.
//!
//! Datalake destinations are plain object stores (S3, MinIO, GCS, Azure
//! Blob): there is no SQL catalog and no merge. The driver keeps a schema
//! manifest object under the namespace prefix and copies load files into a
//! per-table layout:
//!
//! ```text
//! <namespace>/.wharf/schema.json          schema manifest (CAS-updated)
//! <namespace>/<table>/<upload>-<table>/load.csv.gz
//! ```
//!
//! ## Insert/update counting
//!
//! Loads are append-only: `rows_inserted` is the number of rows copied and
//! `rows_updated` is always zero. Deduplication is left to downstream
//! query engines.

use std::sync::Arc;

use bytes::Bytes;

use wharf_core::paths;
use wharf_core::schema::{Schema, TableSchema};
use wharf_core::storage::{ObjectStore, WritePrecondition, WriteResult};
use wharf_core::warehouse::{DestinationType, Warehouse};

use crate::driver::{
    DriverError, ErrorKind, LoadTableStats, Result, Uploader, WarehouseDriver,
};
use crate::loadfile::read_csv_gz;

/// Attempts at the manifest CAS loop before giving up as transient.
const MANIFEST_CAS_ATTEMPTS: u32 = 5;

/// The S3-datalake warehouse driver.
pub struct DatalakeDriver {
    storage: Arc<dyn ObjectStore>,
    namespace: String,
    uploader: Arc<dyn Uploader>,
}

impl DatalakeDriver {
    /// Creates a driver for the warehouse's namespace.
    #[must_use]
    pub fn new(
        warehouse: &Warehouse,
        uploader: Arc<dyn Uploader>,
        storage: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            storage,
            namespace: warehouse.namespace.clone(),
            uploader,
        }
    }

    fn schema_key(&self) -> String {
        paths::datalake_schema_key(&self.namespace)
    }

    /// Reads the manifest and its CAS version. Absent manifest reads as an
    /// empty schema.
    async fn read_manifest(&self) -> Result<(Schema, Option<String>)> {
        let key = self.schema_key();
        let Some(meta) = self.storage.head(&key).await? else {
            return Ok((Schema::new(), None));
        };
        let bytes = self.storage.get(&key).await?;
        let schema: Schema = serde_json::from_slice(&bytes).map_err(|e| {
            DriverError::new(ErrorKind::Fatal, format!("decoding schema manifest: {e}"))
        })?;
        Ok((schema, Some(meta.version)))
    }

    /// Applies `mutate` to the manifest under a CAS loop.
    async fn update_manifest<F>(&self, operation: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut Schema) -> Result<()>,
    {
        for _ in 0..MANIFEST_CAS_ATTEMPTS {
            let (mut schema, version) = self.read_manifest().await?;
            mutate(&mut schema)?;

            let body = serde_json::to_vec(&schema).map_err(|e| {
                DriverError::new(ErrorKind::Fatal, format!("encoding schema manifest: {e}"))
            })?;
            let precondition = match &version {
                Some(v) => WritePrecondition::MatchesVersion(v.clone()),
                None => WritePrecondition::DoesNotExist,
            };
            match self
                .storage
                .put(&self.schema_key(), Bytes::from(body), precondition)
                .await?
            {
                WriteResult::Success { .. } => return Ok(()),
                WriteResult::PreconditionFailed { .. } => {}
            }
        }
        Err(DriverError::in_operation(
            ErrorKind::Transient,
            operation,
            "schema manifest contention, giving up",
        ))
    }
}

#[async_trait::async_trait]
impl WarehouseDriver for DatalakeDriver {
    fn destination_type(&self) -> DestinationType {
        DestinationType::S3Datalake
    }

    async fn connect(&self) -> Result<()> {
        // Listing the namespace prefix exercises bucket access and
        // credentials without writing anything.
        self.storage.list(&format!("{}/", self.namespace)).await?;
        Ok(())
    }

    async fn create_schema(&self) -> Result<()> {
        let body = serde_json::to_vec(&Schema::new()).map_err(|e| {
            DriverError::new(ErrorKind::Fatal, format!("encoding schema manifest: {e}"))
        })?;
        // An existing manifest means the namespace is already created.
        self.storage
            .put(
                &self.schema_key(),
                Bytes::from(body),
                WritePrecondition::DoesNotExist,
            )
            .await?;
        Ok(())
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let table = table.to_string();
        let schema = schema.clone();
        self.update_manifest("create table", move |manifest| {
            if manifest.table(&table).is_none() {
                manifest.insert(&table, schema.clone());
            }
            Ok(())
        })
        .await
    }

    async fn alter_table(&self, table: &str, add_columns: &TableSchema) -> Result<()> {
        let table = table.to_string();
        let add_columns = add_columns.clone();
        self.update_manifest("alter table", move |manifest| {
            let mut merged = manifest.table(&table).cloned().unwrap_or_default();
            merged.merge_from(&table, &add_columns)?;
            manifest.insert(&table, merged);
            Ok(())
        })
        .await
    }

    async fn fetch_schema(&self) -> Result<Schema> {
        let (schema, _) = self.read_manifest().await?;
        Ok(schema)
    }

    async fn load_table(&self, table: &str) -> Result<LoadTableStats> {
        let files = self.uploader.load_files(table).await?;
        if files.is_empty() {
            return Err(DriverError::in_operation(
                ErrorKind::Transient,
                "load table",
                format!("no load files for table {table}"),
            ));
        }

        let mut rows_inserted = 0;
        for file in &files {
            let bytes = self.storage.get(&file.location).await?;
            let row_count = match file.total_rows {
                Some(count) => count,
                None => read_csv_gz(&bytes)?.len() as i64,
            };

            let key = destination_key(&self.namespace, table, &file.location);
            self.storage
                .put(&key, bytes, WritePrecondition::None)
                .await?;
            rows_inserted += row_count;
        }

        Ok(LoadTableStats {
            rows_inserted,
            rows_updated: 0,
        })
    }

    async fn cleanup(&self) -> Result<()> {
        // No staging area: loads write their final objects directly.
        Ok(())
    }
}

/// Derives the datalake object key for a load file.
///
/// The last two segments of the load-file key (`<upload>-<table>/<file>`)
/// carry the upload identity, so re-running a load overwrites the same
/// objects instead of duplicating them.
fn destination_key(namespace: &str, table: &str, location: &str) -> String {
    let mut segments = location.rsplit('/');
    let file = segments.next().unwrap_or("load.csv.gz");
    let upload_dir = segments.next().unwrap_or("upload");
    format!("{namespace}/{table}/{upload_dir}/{file}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use wharf_core::id::{DestinationId, SourceId, WorkspaceId};
    use wharf_core::schema::DataType;
    use wharf_core::storage::MemoryObjectStore;
    use wharf_core::warehouse::{Destination, DestinationConfig, Source};

    use crate::driver::LoadFile;
    use crate::loadfile::write_csv_gz;
    use crate::values::ColumnValue;

    struct FixtureUploader {
        files: HashMap<String, Vec<LoadFile>>,
        schema: TableSchema,
    }

    #[async_trait]
    impl Uploader for FixtureUploader {
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

    fn test_warehouse() -> Warehouse {
        Warehouse {
            source: Source {
                id: SourceId::new("src-1"),
                name: "app".into(),
                enabled: true,
            },
            destination: Destination {
                id: DestinationId::new("dst-1"),
                name: "lake".into(),
                destination_type: DestinationType::S3Datalake,
                enabled: true,
                revision_id: "rev-1".into(),
                config: DestinationConfig::new(),
            },
            workspace_id: WorkspaceId::new("ws-1"),
            namespace: "analytics".into(),
        }
    }

    fn tracks_schema() -> TableSchema {
        TableSchema::new()
            .with_column("id", DataType::String)
            .with_column("test_int", DataType::Int)
    }

    async fn driver_with_load_file(
        rows: &[Vec<ColumnValue>],
    ) -> (DatalakeDriver, Arc<MemoryObjectStore>) {
        let storage = Arc::new(MemoryObjectStore::new());
        let location =
            "rudder-warehouse-load-objects/tracks/src-1/7-tracks/load.csv.gz".to_string();
        storage
            .put(
                &location,
                Bytes::from(write_csv_gz(rows).unwrap()),
                WritePrecondition::None,
            )
            .await
            .unwrap();

        let uploader = Arc::new(FixtureUploader {
            files: HashMap::from([(
                "tracks".to_string(),
                vec![LoadFile {
                    location,
                    total_rows: Some(rows.len() as i64),
                }],
            )]),
            schema: tracks_schema(),
        });

        let driver = DatalakeDriver::new(
            &test_warehouse(),
            uploader,
            Arc::clone(&storage) as Arc<dyn ObjectStore>,
        );
        (driver, storage)
    }

    #[tokio::test]
    async fn create_schema_is_idempotent() {
        let (driver, _storage) = driver_with_load_file(&[]).await;
        driver.create_schema().await.unwrap();
        driver.create_schema().await.unwrap();
    }

    #[tokio::test]
    async fn create_and_fetch_roundtrip() {
        let (driver, _storage) = driver_with_load_file(&[]).await;
        driver.create_schema().await.unwrap();
        driver.create_table("tracks", &tracks_schema()).await.unwrap();
        // Second creation is a no-op.
        driver.create_table("tracks", &tracks_schema()).await.unwrap();

        let fetched = driver.fetch_schema().await.unwrap();
        assert_eq!(fetched.table("tracks"), Some(&tracks_schema()));
    }

    #[tokio::test]
    async fn alter_adds_columns_and_rejects_type_change() {
        let (driver, _storage) = driver_with_load_file(&[]).await;
        driver.create_schema().await.unwrap();
        driver.create_table("tracks", &tracks_schema()).await.unwrap();

        let add = TableSchema::new().with_column("context_ip", DataType::String);
        driver.alter_table("tracks", &add).await.unwrap();
        let fetched = driver.fetch_schema().await.unwrap();
        assert_eq!(
            fetched.table("tracks").unwrap().get("context_ip"),
            Some(DataType::String)
        );

        let conflicting = TableSchema::new().with_column("test_int", DataType::String);
        let err = driver.alter_table("tracks", &conflicting).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaConflict);
    }

    #[tokio::test]
    async fn load_table_copies_files_and_counts_rows() {
        let rows = vec![
            vec![ColumnValue::String("r1".into()), ColumnValue::Int(1)],
            vec![ColumnValue::String("r2".into()), ColumnValue::Int(2)],
        ];
        let (driver, storage) = driver_with_load_file(&rows).await;

        let stats = driver.load_table("tracks").await.unwrap();
        assert_eq!(stats.rows_inserted, 2);
        assert_eq!(stats.rows_updated, 0);

        let copied = storage
            .get("analytics/tracks/7-tracks/load.csv.gz")
            .await
            .unwrap();
        assert_eq!(read_csv_gz(&copied).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rerun_overwrites_the_same_objects() {
        let rows = vec![vec![ColumnValue::String("r1".into()), ColumnValue::Int(1)]];
        let (driver, storage) = driver_with_load_file(&rows).await;

        driver.load_table("tracks").await.unwrap();
        driver.load_table("tracks").await.unwrap();

        let listed = storage.list("analytics/tracks/").await.unwrap();
        assert_eq!(listed.len(), 1, "rerun must not duplicate objects");
    }

    #[tokio::test]
    async fn load_table_without_files_is_an_error() {
        let (driver, _storage) = driver_with_load_file(&[]).await;
        let err = driver.load_table("pages").await.unwrap_err();
        assert!(err.to_string().contains("no load files"));
    }

    #[test]
    fn destination_key_keeps_upload_identity() {
        let key = destination_key(
            "analytics",
            "tracks",
            "rudder-warehouse-load-objects/tracks/src-1/42-tracks/load.2.csv.gz",
        );
        assert_eq!(key, "analytics/tracks/42-tracks/load.2.csv.gz");
    }
}
