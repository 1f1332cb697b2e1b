//! PostgreSQL reference driver.
//!
//! Loads are staged into a per-load table then merged into the destination
//! table in one statement, keyed by `id`:
//!
//! ```text
//! load files ──> rudder_staging_<table>_<ulid> ──INSERT..ON CONFLICT──> <table>
//! ```
//!
//! ## Insert/update counting
//!
//! The merge counts a row as inserted when `xmax = 0` on the returned
//! tuple, and as updated otherwise. An update that writes identical values
//! still counts as an update; re-running a load therefore reports
//! `rows_inserted = 0, rows_updated = N` for dedupable tables.
//!
//! ## Error surface
//!
//! Server errors are preserved verbatim in the `pq: <message>` wire form,
//! prefixed by the failing operation (`pinging: …`, `create table: …`), so
//! the error history an operator sees matches what the server said.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, Row};
use ulid::Ulid;

use wharf_core::schema::{DataType, Schema, TableSchema};
use wharf_core::storage::ObjectStore;
use wharf_core::warehouse::{DestinationType, Warehouse};

use crate::discards::{discards_schema, DiscardRow, DISCARDS_TABLE};
use crate::driver::{
    DriverError, ErrorKind, LoadTableStats, Result, Uploader, WarehouseDriver,
};
use crate::loadfile::read_csv_gz;
use crate::values::{process_column_value, wide_to_string, ColumnValue, StringPolicy};

/// Prefix of per-load staging tables; excluded from fetched schemas and
/// dropped by `cleanup`.
pub const STAGING_TABLE_PREFIX: &str = "rudder_staging_";

const INSERT_BATCH: usize = 500;

/// The PostgreSQL warehouse driver.
pub struct PostgresDriver {
    pool: PgPool,
    namespace: String,
    uploader: Arc<dyn Uploader>,
    storage: Arc<dyn ObjectStore>,
    policy: StringPolicy,
}

impl PostgresDriver {
    /// Opens a lazy connection pool for the warehouse.
    ///
    /// The pool connects on first use; connectivity errors surface from
    /// [`WarehouseDriver::connect`] (and every later operation), not from
    /// construction.
    ///
    /// # Errors
    ///
    /// Returns a fatal error when the destination config is incomplete.
    pub fn open(
        warehouse: &Warehouse,
        uploader: Arc<dyn Uploader>,
        storage: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let url = connection_url(warehouse)?;
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(&url)
            .map_err(|e| DriverError::new(ErrorKind::Fatal, format!("opening pool: {e}")))?;

        Ok(Self {
            pool,
            namespace: warehouse.namespace.clone(),
            uploader,
            storage,
            policy: StringPolicy::unbounded(),
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.namespace), quote_ident(table))
    }

    async fn append_rows(
        &self,
        qualified_table: &str,
        columns: &[(String, DataType)],
        rows: &[Vec<ColumnValue>],
        operation: &str,
    ) -> Result<u64> {
        let column_list = column_list(columns);
        let mut affected = 0;
        for chunk in rows.chunks(INSERT_BATCH) {
            let mut qb = sqlx::QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {qualified_table} ({column_list}) "
            ));
            qb.push_values(chunk, |mut b, row| {
                for (value, (_, data_type)) in row.iter().zip(columns) {
                    push_bind_value(&mut b, value, *data_type);
                }
            });
            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| pg_error(operation, e))?;
            affected += result.rows_affected();
        }
        Ok(affected)
    }

    async fn route_discards(&self, discards: Vec<DiscardRow>) -> Result<()> {
        if discards.is_empty() {
            return Ok(());
        }
        let schema = discards_schema();
        self.create_table(DISCARDS_TABLE, &schema).await?;
        let columns: Vec<(String, DataType)> = schema
            .iter()
            .map(|(name, ty)| (name.to_string(), ty))
            .collect();
        let rows: Vec<Vec<ColumnValue>> = discards.iter().map(DiscardRow::values).collect();
        self.append_rows(&self.qualified(DISCARDS_TABLE), &columns, &rows, "load table")
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl WarehouseDriver for PostgresDriver {
    fn destination_type(&self) -> DestinationType {
        DestinationType::Postgres
    }

    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| pg_error("pinging", e))?;
        Ok(())
    }

    async fn create_schema(&self) -> Result<()> {
        let sql = format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(&self.namespace));
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| pg_error("create schema", e))?;
        Ok(())
    }

    async fn create_table(&self, table: &str, schema: &TableSchema) -> Result<()> {
        let sql = build_create_table_sql(&self.namespace, table, schema);
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| pg_error("create table", e))?;
        Ok(())
    }

    async fn alter_table(&self, table: &str, add_columns: &TableSchema) -> Result<()> {
        for (column, data_type) in add_columns.iter() {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                self.qualified(table),
                quote_ident(column),
                pg_type(data_type)
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| pg_error("alter table", e))?;
        }
        Ok(())
    }

    async fn fetch_schema(&self) -> Result<Schema> {
        let rows = sqlx::query(
            "SELECT table_name, column_name, data_type \
             FROM information_schema.columns WHERE table_schema = $1",
        )
        .bind(&self.namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| pg_error("fetch schema", e))?;

        let mut tables: std::collections::BTreeMap<String, TableSchema> =
            std::collections::BTreeMap::new();
        for row in rows {
            let table: String = row
                .try_get("table_name")
                .map_err(|e| pg_error("fetch schema", e))?;
            if table.starts_with(STAGING_TABLE_PREFIX) {
                continue;
            }
            let column: String = row
                .try_get("column_name")
                .map_err(|e| pg_error("fetch schema", e))?;
            let pg_data_type: String = row
                .try_get("data_type")
                .map_err(|e| pg_error("fetch schema", e))?;

            let Some(data_type) = logical_type(&pg_data_type) else {
                tracing::warn!(table, column, pg_data_type, "skipping unrecognized column type");
                continue;
            };

            tables.entry(table).or_default().insert(column, data_type);
        }
        Ok(tables.into_iter().collect())
    }

    async fn load_table(&self, table: &str) -> Result<LoadTableStats> {
        let upload_schema = self.uploader.schema_in_upload(table);
        let warehouse_schema = self.uploader.schema_in_warehouse(table);

        // Columns present in the upload but absent from the warehouse are
        // discarded; the rest load normally.
        let mut load_columns: Vec<(String, DataType)> = Vec::new();
        let mut extra_columns: Vec<String> = Vec::new();
        for (column, data_type) in upload_schema.iter() {
            if warehouse_schema.get(column).is_some() {
                load_columns.push((column.to_string(), data_type));
            } else {
                extra_columns.push(column.to_string());
            }
        }
        if load_columns.is_empty() {
            return Err(DriverError::in_operation(
                ErrorKind::Fatal,
                "load table",
                format!("no loadable columns for table {table}"),
            ));
        }

        let files = self.uploader.load_files(table).await?;
        if files.is_empty() {
            return Err(DriverError::in_operation(
                ErrorKind::Transient,
                "load table",
                format!("no load files for table {table}"),
            ));
        }

        let now = Utc::now();
        let upload_columns = upload_schema.columns();
        let id_idx = upload_columns.iter().position(|c| *c == "id");
        let received_idx = upload_columns.iter().position(|c| *c == "received_at");

        let mut rows: Vec<Vec<ColumnValue>> = Vec::new();
        let mut discards: Vec<DiscardRow> = Vec::new();
        for file in &files {
            let bytes = self.storage.get(&file.location).await?;
            for record in read_csv_gz(&bytes)? {
                if record.len() != upload_schema.len() {
                    return Err(DriverError::in_operation(
                        ErrorKind::Fatal,
                        "load table",
                        format!(
                            "mismatch in number of columns: expected {}, got {}",
                            upload_schema.len(),
                            record.len()
                        ),
                    ));
                }

                let row_id = id_idx.map(|idx| record[idx].clone()).unwrap_or_default();
                let received_at = received_idx
                    .and_then(|idx| DateTime::parse_from_rfc3339(&record[idx]).ok())
                    .map(|dt| dt.with_timezone(&Utc));

                let mut row = Vec::with_capacity(load_columns.len());
                for (idx, (column, data_type)) in upload_schema.iter().enumerate() {
                    let raw = &record[idx];
                    if extra_columns.iter().any(|c| c == column) {
                        if !raw.is_empty() && table != DISCARDS_TABLE {
                            discards.push(DiscardRow::new(
                                table,
                                row_id.as_str(),
                                column,
                                raw.as_str(),
                                received_at,
                                now,
                            ));
                        }
                        continue;
                    }
                    match process_column_value(raw, data_type, &self.policy) {
                        Ok(value) => row.push(value),
                        Err(_) => {
                            if table != DISCARDS_TABLE {
                                discards.push(DiscardRow::new(
                                    table,
                                    row_id.as_str(),
                                    column,
                                    raw.as_str(),
                                    received_at,
                                    now,
                                ));
                            }
                            row.push(ColumnValue::Null);
                        }
                    }
                }
                rows.push(row);
            }
        }

        let staging = format!(
            "{STAGING_TABLE_PREFIX}{table}_{}",
            Ulid::new().to_string().to_lowercase()
        );
        let qualified_staging = self.qualified(&staging);
        let qualified_table = self.qualified(table);

        let sql = format!("CREATE TABLE {qualified_staging} (LIKE {qualified_table})");
        sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| pg_error("load table", e))?;

        let stats: Result<LoadTableStats> = async {
            self.append_rows(&qualified_staging, &load_columns, &rows, "load table")
                .await?;

            let has_id = load_columns.iter().any(|(c, _)| c == "id");
            if has_id {
                let sql = build_merge_sql(&self.namespace, table, &staging, &load_columns);
                let returned = sqlx::query(&sql)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(|e| pg_error("load table", e))?;
                let rows_inserted = returned
                    .iter()
                    .filter(|row| row.try_get::<bool, _>("inserted").unwrap_or(false))
                    .count() as i64;
                Ok(LoadTableStats {
                    rows_inserted,
                    rows_updated: returned.len() as i64 - rows_inserted,
                })
            } else {
                let column_list = column_list(&load_columns);
                let sql = format!(
                    "INSERT INTO {qualified_table} ({column_list}) \
                     SELECT {column_list} FROM {qualified_staging}"
                );
                let result = sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| pg_error("load table", e))?;
                Ok(LoadTableStats {
                    rows_inserted: result.rows_affected() as i64,
                    rows_updated: 0,
                })
            }
        }
        .await;

        // Drop the staging table on both paths; cleanup() catches leftovers
        // from interrupted loads.
        let drop_sql = format!("DROP TABLE IF EXISTS {qualified_staging}");
        let _ = sqlx::query(&drop_sql).execute(&self.pool).await;

        let stats = stats?;
        self.route_discards(discards).await?;
        Ok(stats)
    }

    async fn cleanup(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT table_name FROM information_schema.tables \
             WHERE table_schema = $1 AND table_name LIKE $2",
        )
        .bind(&self.namespace)
        .bind(format!("{STAGING_TABLE_PREFIX}%"))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| pg_error("cleanup", e))?;

        for row in rows {
            let table: String = row.try_get("table_name").map_err(|e| pg_error("cleanup", e))?;
            let sql = format!("DROP TABLE IF EXISTS {}", self.qualified(&table));
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| pg_error("cleanup", e))?;
        }
        Ok(())
    }
}

/// Builds the connection URL from the destination config.
///
/// # Errors
///
/// Returns a fatal error when a required key is missing.
pub fn connection_url(warehouse: &Warehouse) -> Result<String> {
    let config = &warehouse.destination.config;
    let required = |key: &str, value: Option<&str>| {
        value.map(str::to_string).ok_or_else(|| {
            DriverError::new(
                ErrorKind::Fatal,
                format!("destination config is missing {key}"),
            )
        })
    };

    let host = required("host", config.host())?;
    let port = required("port", config.port())?;
    let database = required("database", config.database())?;
    let user = required("user", config.user())?;
    let password = config.password().unwrap_or_default();
    let ssl_mode = config.ssl_mode().unwrap_or("disable");

    Ok(format!(
        "postgres://{user}:{password}@{host}:{port}/{database}?sslmode={ssl_mode}"
    ))
}

/// Doubles embedded quotes and wraps the identifier.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn column_list(columns: &[(String, DataType)]) -> String {
    columns
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps a logical type to its Postgres physical type.
const fn pg_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Int => "bigint",
        DataType::Float => "double precision",
        DataType::Boolean => "boolean",
        DataType::String => "text",
        DataType::Datetime => "timestamptz",
        DataType::Json => "jsonb",
    }
}

/// Maps an `information_schema` data type back to a logical type.
fn logical_type(pg_data_type: &str) -> Option<DataType> {
    match pg_data_type {
        "bigint" | "integer" | "smallint" => Some(DataType::Int),
        "double precision" | "real" | "numeric" => Some(DataType::Float),
        "boolean" => Some(DataType::Boolean),
        "timestamp with time zone" | "timestamp without time zone" | "date" => {
            Some(DataType::Datetime)
        }
        "jsonb" | "json" => Some(DataType::Json),
        "text" | "character varying" | "character" => Some(DataType::String),
        _ => None,
    }
}

fn build_create_table_sql(namespace: &str, table: &str, schema: &TableSchema) -> String {
    let mut columns: Vec<String> = schema
        .iter()
        .map(|(name, ty)| format!("{} {}", quote_ident(name), pg_type(ty)))
        .collect();
    if schema.get("id").is_some() {
        columns.push(format!("PRIMARY KEY ({})", quote_ident("id")));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} ({})",
        quote_ident(namespace),
        quote_ident(table),
        columns.join(", ")
    )
}

/// Builds the staged-merge statement for a dedupable table.
///
/// `DISTINCT ON (id)` collapses duplicate ids within the staged batch
/// (latest `received_at` wins when present); `ON CONFLICT` merges against
/// committed rows; `xmax = 0` marks freshly inserted tuples.
fn build_merge_sql(
    namespace: &str,
    table: &str,
    staging: &str,
    columns: &[(String, DataType)],
) -> String {
    let column_list = column_list(columns);
    let set_clause: Vec<String> = columns
        .iter()
        .filter(|(name, _)| name != "id")
        .map(|(name, _)| {
            let quoted = quote_ident(name);
            format!("{quoted} = EXCLUDED.{quoted}")
        })
        .collect();
    let order_by = if columns.iter().any(|(c, _)| c == "received_at") {
        format!("{}, {} DESC", quote_ident("id"), quote_ident("received_at"))
    } else {
        quote_ident("id")
    };

    let conflict_action = if set_clause.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", set_clause.join(", "))
    };

    format!(
        "INSERT INTO {ns}.{t} ({column_list}) \
         SELECT DISTINCT ON ({id}) {column_list} FROM {ns}.{s} ORDER BY {order_by} \
         ON CONFLICT ({id}) {conflict_action} \
         RETURNING (xmax = 0) AS inserted",
        ns = quote_ident(namespace),
        t = quote_ident(table),
        s = quote_ident(staging),
        id = quote_ident("id"),
    )
}

/// Maps a sqlx error to the driver taxonomy, preserving the server message
/// in the `pq:` wire form.
fn pg_error(operation: &str, err: sqlx::Error) -> DriverError {
    match err.as_database_error() {
        Some(db) => {
            let kind = db
                .code()
                .map_or(ErrorKind::Fatal, |code| classify_sqlstate(&code));
            DriverError::in_operation(kind, operation, format!("pq: {}", db.message()))
        }
        None => DriverError::in_operation(ErrorKind::Transient, operation, err),
    }
}

/// Classifies a SQLSTATE code into the driver error taxonomy.
fn classify_sqlstate(code: &str) -> ErrorKind {
    match code {
        "42501" => ErrorKind::Permissions,
        "40001" | "40P01" => ErrorKind::Transient,
        "42804" | "42846" => ErrorKind::SchemaConflict,
        _ if code.starts_with("28") => ErrorKind::Permissions,
        _ if code.starts_with("08") || code.starts_with("53") || code.starts_with("57") => {
            ErrorKind::Transient
        }
        _ if code.starts_with("22") => ErrorKind::DataQuality,
        _ => ErrorKind::Fatal,
    }
}

fn push_bind_value(
    b: &mut Separated<'_, '_, Postgres, &'static str>,
    value: &ColumnValue,
    data_type: DataType,
) {
    match value {
        ColumnValue::Null => match data_type {
            DataType::Int => {
                b.push_bind(None::<i64>);
            }
            DataType::Float => {
                b.push_bind(None::<f64>);
            }
            DataType::Boolean => {
                b.push_bind(None::<bool>);
            }
            DataType::Datetime => {
                b.push_bind(None::<DateTime<Utc>>);
            }
            DataType::Json => {
                b.push_bind(None::<serde_json::Value>);
            }
            DataType::String => {
                b.push_bind(None::<String>);
            }
        },
        ColumnValue::Int(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Float(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Boolean(v) => {
            b.push_bind(*v);
        }
        ColumnValue::Datetime(v) => {
            b.push_bind(*v);
        }
        ColumnValue::String(v) => {
            b.push_bind(v.clone());
        }
        ColumnValue::Wide(bytes) => {
            b.push_bind(wide_to_string(bytes));
        }
        ColumnValue::Json(text) => {
            let value: serde_json::Value =
                serde_json::from_str(text).unwrap_or(serde_json::Value::Null);
            b.push_bind(value);
        }
    }
}
