//! Load-file generation: staged event batches to per-table CSV files.
//!
//! Staging files are gzipped newline-delimited JSON, one event per line:
//!
//! ```json
//! {"table": "tracks", "data": {"id": "r1", "received_at": "2024-03-07T10:00:00Z", ...}}
//! ```
//!
//! The generator groups events by table, converts every value to its
//! logical type, and writes one gzipped CSV per table at the deterministic
//! key `rudder-warehouse-load-objects/<table>/<source>/<uploadId>-<table>/load.csv.gz`.
//! Re-running the phase overwrites the same keys, which is what makes it
//! idempotent.
//!
//! Values that fail conversion, and values for columns the upload schema
//! does not carry, are routed to the discards table and never fail the
//! upload.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use wharf_core::id::{SourceId, UploadId};
use wharf_core::paths;
use wharf_core::schema::Schema;
use wharf_core::storage::{ObjectStore, WritePrecondition};

use crate::discards::{DiscardRow, DISCARDS_TABLE};
use crate::driver::{DriverError, ErrorKind, LoadFile, Result};
use crate::values::{process_column_value, ColumnValue, StringPolicy};

/// One staged event, as parsed from a staging-file line.
#[derive(Debug, Clone, Deserialize)]
pub struct StagingEvent {
    /// Destination table of the event.
    pub table: String,
    /// Column values, keyed by column name.
    pub data: serde_json::Map<String, Value>,
}

/// Load files generated for one table.
#[derive(Debug, Clone)]
pub struct TableLoadFiles {
    /// The table.
    pub table: String,
    /// Written load files, in part order.
    pub files: Vec<LoadFile>,
    /// Total events written across parts.
    pub total_events: i64,
}

/// Result of one load-file generation phase.
#[derive(Debug, Clone)]
pub struct GeneratedLoadFiles {
    /// Per-table results, sorted by table name. Includes the discards
    /// table when any value was discarded.
    pub tables: Vec<TableLoadFiles>,
    /// Number of discarded values.
    pub discarded: i64,
}

impl GeneratedLoadFiles {
    /// Returns the result for one table, if events were written for it.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableLoadFiles> {
        self.tables.iter().find(|t| t.table == name)
    }
}

/// Generates per-table load files from staged event batches.
pub struct LoadFileGenerator<S: ObjectStore + ?Sized> {
    storage: Arc<S>,
    policy: StringPolicy,
    max_rows_per_file: usize,
}

impl<S: ObjectStore + ?Sized> LoadFileGenerator<S> {
    /// Default rows per load-file part before rotation.
    pub const DEFAULT_MAX_ROWS_PER_FILE: usize = 500_000;

    /// Creates a generator with the unbounded string policy.
    #[must_use]
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            policy: StringPolicy::unbounded(),
            max_rows_per_file: Self::DEFAULT_MAX_ROWS_PER_FILE,
        }
    }

    /// Sets the string policy used during value conversion.
    #[must_use]
    pub const fn with_policy(mut self, policy: StringPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the part-rotation threshold.
    #[must_use]
    pub fn with_max_rows_per_file(mut self, max: usize) -> Self {
        self.max_rows_per_file = max.max(1);
        self
    }

    /// Runs one generation pass over the given staging files.
    ///
    /// # Errors
    ///
    /// Returns an error when a staging file cannot be read or decoded, or
    /// when a load file cannot be written. Individual bad values never
    /// fail the pass; they become discard rows.
    pub async fn generate(
        &self,
        upload_id: UploadId,
        source: &SourceId,
        schema: &Schema,
        staging_locations: &[String],
        now: DateTime<Utc>,
    ) -> Result<GeneratedLoadFiles> {
        let mut rows: BTreeMap<String, Vec<Vec<ColumnValue>>> = BTreeMap::new();
        let mut discards: Vec<DiscardRow> = Vec::new();

        for location in staging_locations {
            let bytes = self.storage.get(location).await?;
            for event in parse_staging_file(&bytes)? {
                let Some(table_schema) = schema.table(&event.table) else {
                    warn!(table = %event.table, "staged event for table outside the upload schema");
                    continue;
                };

                let row_id = event
                    .data
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let received_at = event
                    .data
                    .get("received_at")
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                let mut row = Vec::with_capacity(table_schema.len());
                for (column, data_type) in table_schema.iter() {
                    let raw = event.data.get(column).map(render_raw).unwrap_or_default();
                    match process_column_value(&raw, data_type, &self.policy) {
                        Ok(value) => row.push(value),
                        Err(_) => {
                            discards.push(DiscardRow::new(
                                event.table.as_str(),
                                row_id.as_str(),
                                column,
                                raw,
                                received_at,
                                now,
                            ));
                            row.push(ColumnValue::Null);
                        }
                    }
                }

                // Values for columns the upload schema does not carry are
                // discarded, not silently dropped.
                for (column, value) in &event.data {
                    if table_schema.get(column).is_none() {
                        discards.push(DiscardRow::new(
                            event.table.as_str(),
                            row_id.as_str(),
                            column.as_str(),
                            render_raw(value),
                            received_at,
                            now,
                        ));
                    }
                }

                rows.entry(event.table).or_default().push(row);
            }
        }

        let discarded = discards.len() as i64;
        if !discards.is_empty() {
            rows.entry(DISCARDS_TABLE.to_string())
                .or_default()
                .extend(discards.iter().map(DiscardRow::values));
        }

        let mut tables = Vec::with_capacity(rows.len());
        for (table, table_rows) in &rows {
            let mut files = Vec::new();
            for (part, chunk) in table_rows.chunks(self.max_rows_per_file).enumerate() {
                let key = paths::load_file_key(table, source, upload_id, part);
                let body = write_csv_gz(chunk)?;
                self.storage
                    .put(&key, Bytes::from(body), WritePrecondition::None)
                    .await?;
                files.push(LoadFile {
                    location: key,
                    total_rows: Some(chunk.len() as i64),
                });
            }
            tables.push(TableLoadFiles {
                table: table.clone(),
                files,
                total_events: table_rows.len() as i64,
            });
        }

        Ok(GeneratedLoadFiles { tables, discarded })
    }
}

/// Renders a raw JSON value to the text form value conversion expects.
///
/// Strings render unquoted; everything else renders as compact JSON, which
/// is also the canonical text form for numbers and booleans.
#[must_use]
pub fn render_raw(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Parses a gzipped newline-delimited JSON staging file.
///
/// # Errors
///
/// Returns an error when the gzip stream or a line is malformed.
pub fn parse_staging_file(bytes: &Bytes) -> Result<Vec<StagingEvent>> {
    let mut decoder = GzDecoder::new(&bytes[..]);
    let mut text = String::new();
    decoder
        .read_to_string(&mut text)
        .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("decoding staging file: {e}")))?;

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line).map_err(|e| {
                DriverError::new(ErrorKind::Fatal, format!("parsing staging event: {e}"))
            })
        })
        .collect()
}

/// Serializes rows into a gzipped headerless CSV.
///
/// # Errors
///
/// Returns an error when serialization fails.
pub fn write_csv_gz(rows: &[Vec<ColumnValue>]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut writer = csv::Writer::from_writer(encoder);
    for row in rows {
        writer
            .write_record(row.iter().map(ColumnValue::to_field))
            .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("writing load file: {e}")))?;
    }
    writer
        .into_inner()
        .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("writing load file: {e}")))?
        .finish()
        .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("writing load file: {e}")))
}

/// Parses a gzipped headerless CSV load file into raw text records.
///
/// # Errors
///
/// Returns an error when the gzip stream or CSV framing is malformed.
pub fn read_csv_gz(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let decoder = GzDecoder::new(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(decoder);

    let mut records = Vec::new();
    for record in reader.records() {
        let record = record
            .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("reading load file: {e}")))?;
        records.push(record.iter().map(str::to_string).collect());
    }
    Ok(records)
}

/// Builds a staging-file body from events (used by tests and the
/// validator's synthetic loads).
///
/// # Errors
///
/// Returns an error when serialization fails.
pub fn write_staging_file(events: &[Value]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    for event in events {
        let line = serde_json::to_string(event)
            .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("writing staging file: {e}")))?;
        encoder
            .write_all(line.as_bytes())
            .and_then(|()| encoder.write_all(b"\n"))
            .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("writing staging file: {e}")))?;
    }
    encoder
        .finish()
        .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("writing staging file: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wharf_core::schema::{DataType, TableSchema};
    use wharf_core::storage::MemoryObjectStore;

    fn tracks_schema() -> Schema {
        Schema::new().with_table(
            "tracks",
            TableSchema::new()
                .with_column("id", DataType::String)
                .with_column("received_at", DataType::Datetime)
                .with_column("test_int", DataType::Int),
        )
    }

    async fn seed_staging(storage: &MemoryObjectStore, key: &str, events: &[Value]) {
        let body = write_staging_file(events).unwrap();
        storage
            .put(key, Bytes::from(body), WritePrecondition::None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn generates_one_load_file_per_table() {
        let storage = Arc::new(MemoryObjectStore::new());
        seed_staging(
            &storage,
            "staging/1",
            &[
                json!({"table": "tracks", "data": {"id": "r1", "received_at": "2024-03-07T10:00:00Z", "test_int": "1"}}),
                json!({"table": "tracks", "data": {"id": "r2", "received_at": "2024-03-07T10:01:00Z", "test_int": "2"}}),
            ],
        )
        .await;

        let generator = LoadFileGenerator::new(Arc::clone(&storage));
        let generated = generator
            .generate(
                UploadId::new(7),
                &SourceId::new("src-1"),
                &tracks_schema(),
                &["staging/1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        let tracks = generated.table("tracks").unwrap();
        assert_eq!(tracks.total_events, 2);
        assert_eq!(tracks.files.len(), 1);
        assert_eq!(
            tracks.files[0].location,
            "rudder-warehouse-load-objects/tracks/src-1/7-tracks/load.csv.gz"
        );

        let body = storage.get(&tracks.files[0].location).await.unwrap();
        let records = read_csv_gz(&body).unwrap();
        assert_eq!(records.len(), 2);
        // Columns in sorted schema order: id, received_at, test_int.
        assert_eq!(records[0][0], "r1");
        assert_eq!(records[0][2], "1");
    }

    #[tokio::test]
    async fn bad_values_are_discarded_not_fatal() {
        let storage = Arc::new(MemoryObjectStore::new());
        seed_staging(
            &storage,
            "staging/1",
            &[json!({"table": "tracks", "data": {"id": "r1", "received_at": "2024-03-07T10:00:00Z", "test_int": "1.01"}})],
        )
        .await;

        let generator = LoadFileGenerator::new(Arc::clone(&storage));
        let generated = generator
            .generate(
                UploadId::new(7),
                &SourceId::new("src-1"),
                &tracks_schema(),
                &["staging/1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(generated.discarded, 1);
        let discards = generated.table(DISCARDS_TABLE).unwrap();
        assert_eq!(discards.total_events, 1);
        // The bad value loads as NULL in the main table.
        let tracks = generated.table("tracks").unwrap();
        assert_eq!(tracks.total_events, 1);
    }

    #[tokio::test]
    async fn columns_outside_schema_are_discarded() {
        let storage = Arc::new(MemoryObjectStore::new());
        seed_staging(
            &storage,
            "staging/1",
            &[json!({"table": "tracks", "data": {"id": "r1", "received_at": "2024-03-07T10:00:00Z", "test_int": "1", "surprise": "x"}})],
        )
        .await;

        let generator = LoadFileGenerator::new(Arc::clone(&storage));
        let generated = generator
            .generate(
                UploadId::new(7),
                &SourceId::new("src-1"),
                &tracks_schema(),
                &["staging/1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(generated.discarded, 1);
    }

    #[tokio::test]
    async fn rotation_splits_parts() {
        let storage = Arc::new(MemoryObjectStore::new());
        let events: Vec<Value> = (0..5)
            .map(|i| {
                json!({"table": "tracks", "data": {"id": format!("r{i}"), "received_at": "2024-03-07T10:00:00Z", "test_int": "1"}})
            })
            .collect();
        seed_staging(&storage, "staging/1", &events).await;

        let generator =
            LoadFileGenerator::new(Arc::clone(&storage)).with_max_rows_per_file(2);
        let generated = generator
            .generate(
                UploadId::new(7),
                &SourceId::new("src-1"),
                &tracks_schema(),
                &["staging/1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        let tracks = generated.table("tracks").unwrap();
        assert_eq!(tracks.files.len(), 3);
        assert_eq!(tracks.total_events, 5);
    }

    #[tokio::test]
    async fn rerun_overwrites_the_same_keys() {
        let storage = Arc::new(MemoryObjectStore::new());
        seed_staging(
            &storage,
            "staging/1",
            &[json!({"table": "tracks", "data": {"id": "r1", "received_at": "2024-03-07T10:00:00Z", "test_int": "1"}})],
        )
        .await;

        let generator = LoadFileGenerator::new(Arc::clone(&storage));
        let first = generator
            .generate(
                UploadId::new(7),
                &SourceId::new("src-1"),
                &tracks_schema(),
                &["staging/1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();
        let second = generator
            .generate(
                UploadId::new(7),
                &SourceId::new("src-1"),
                &tracks_schema(),
                &["staging/1".to_string()],
                Utc::now(),
            )
            .await
            .unwrap();

        assert_eq!(
            first.table("tracks").unwrap().files[0].location,
            second.table("tracks").unwrap().files[0].location
        );
    }

    #[test]
    fn csv_roundtrip_preserves_fields() {
        let rows = vec![vec![
            ColumnValue::String("a,b".into()),
            ColumnValue::Int(7),
            ColumnValue::Null,
        ]];
        let body = write_csv_gz(&rows).unwrap();
        let records = read_csv_gz(&body).unwrap();
        assert_eq!(records, vec![vec!["a,b".to_string(), "7".into(), String::new()]]);
    }
}
