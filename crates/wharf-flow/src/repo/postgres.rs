//! Postgres store implementations.
//!
//! Persists to the `wh_uploads`, `wh_table_uploads` and `wh_staging_files`
//! tables (all timestamps UTC). The single-active-upload invariant is
//! enforced twice: by the advisory lock around upload creation and by a
//! partial unique index on the pair over non-terminal statuses, so a
//! misbehaving process cannot violate it either.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use wharf_core::id::{DestinationId, SourceId, StagingFileId, UploadId, WorkspaceId};
use wharf_core::schema::Schema;
use wharf_core::warehouse::DestinationType;

use super::{CasResult, StagingFileStore, TableUploadStore, UploadDraft, UploadStore};
use crate::error::{Error, Result};
use crate::staging::{StagingFile, StagingFileDraft};
use crate::upload::{
    LoadFileType, StatusTiming, TableUpload, TableUploadStatus, Upload, UploadMetadata,
    UploadStatus,
};

const TERMINAL_STATUSES: &str = "('exported_data','aborted')";
const IN_PROGRESS_STATUSES: &str =
    "('generating_load_files','updating_table_uploads_counts','creating_remote_schema','exporting_data')";

/// Creates the control-plane tables and indexes if absent.
///
/// # Errors
///
/// Returns an error when DDL execution fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS wh_staging_files (
            id BIGSERIAL PRIMARY KEY,
            source_id TEXT NOT NULL,
            destination_id TEXT NOT NULL,
            location TEXT NOT NULL,
            schema JSONB NOT NULL,
            total_events BIGINT NOT NULL,
            size_bytes BIGINT NOT NULL,
            first_event_at TIMESTAMPTZ,
            last_event_at TIMESTAMPTZ,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
        "CREATE INDEX IF NOT EXISTS wh_staging_files_pair_idx
            ON wh_staging_files (source_id, destination_id, id)",
        "CREATE TABLE IF NOT EXISTS wh_uploads (
            id BIGSERIAL PRIMARY KEY,
            source_id TEXT NOT NULL,
            destination_id TEXT NOT NULL,
            destination_type TEXT NOT NULL,
            namespace TEXT NOT NULL,
            workspace_id TEXT NOT NULL,
            status TEXT NOT NULL,
            schema JSONB NOT NULL,
            merged_schema JSONB,
            start_staging_file_id BIGINT NOT NULL,
            end_staging_file_id BIGINT NOT NULL,
            first_event_at TIMESTAMPTZ,
            last_event_at TIMESTAMPTZ,
            priority INT NOT NULL DEFAULT 0,
            retry_count INT NOT NULL DEFAULT 0,
            next_retry_at TIMESTAMPTZ,
            load_file_type TEXT NOT NULL DEFAULT 'csv',
            timings JSONB NOT NULL DEFAULT '[]'::jsonb,
            error JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )",
        "CREATE UNIQUE INDEX IF NOT EXISTS wh_uploads_single_active_idx
            ON wh_uploads (source_id, destination_id)
            WHERE status NOT IN ('exported_data','aborted')",
        "CREATE INDEX IF NOT EXISTS wh_uploads_pending_idx
            ON wh_uploads (destination_type, status, priority, created_at)",
        "CREATE TABLE IF NOT EXISTS wh_table_uploads (
            id BIGSERIAL PRIMARY KEY,
            upload_id BIGINT NOT NULL,
            table_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'waiting',
            error TEXT,
            last_exec_at TIMESTAMPTZ,
            total_events BIGINT NOT NULL DEFAULT 0,
            location TEXT,
            rows_inserted BIGINT NOT NULL DEFAULT 0,
            rows_updated BIGINT NOT NULL DEFAULT 0,
            UNIQUE (upload_id, table_name)
        )",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| db_err("ensuring control-plane schema", e))?;
    }
    Ok(())
}

fn db_err(context: &str, err: sqlx::Error) -> Error {
    Error::storage_with_source(context.to_string(), err)
}

fn json_column<T: serde::de::DeserializeOwned>(row: &PgRow, column: &str) -> Result<T> {
    let value: serde_json::Value = row
        .try_get(column)
        .map_err(|e| db_err("reading json column", e))?;
    serde_json::from_value(value).map_err(|e| Error::Serialization {
        message: format!("decoding column {column}: {e}"),
    })
}

fn upload_from_row(row: &PgRow) -> Result<Upload> {
    let get_err = |e| db_err("reading upload row", e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let destination_type: String = row.try_get("destination_type").map_err(get_err)?;
    let load_file_type: String = row.try_get("load_file_type").map_err(get_err)?;
    let timings: Vec<StatusTiming> = json_column(row, "timings")?;
    let error: BTreeMap<String, Vec<String>> = json_column(row, "error")?;
    let schema: Schema = json_column(row, "schema")?;
    let merged_schema: Option<serde_json::Value> =
        row.try_get("merged_schema").map_err(get_err)?;
    let merged_schema = merged_schema
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| Error::Serialization {
            message: format!("decoding merged schema: {e}"),
        })?;

    #[allow(clippy::cast_sign_loss)]
    let retry_count = row.try_get::<i32, _>("retry_count").map_err(get_err)?.max(0) as u32;

    Ok(Upload {
        id: UploadId::new(row.try_get("id").map_err(get_err)?),
        source_id: SourceId::new(row.try_get::<String, _>("source_id").map_err(get_err)?),
        destination_id: DestinationId::new(
            row.try_get::<String, _>("destination_id").map_err(get_err)?,
        ),
        destination_type: destination_type
            .parse()
            .map_err(|e: wharf_core::Error| Error::Serialization {
                message: e.to_string(),
            })?,
        namespace: row.try_get("namespace").map_err(get_err)?,
        workspace_id: WorkspaceId::new(row.try_get::<String, _>("workspace_id").map_err(get_err)?),
        status: UploadStatus::parse(&status)?,
        schema,
        merged_schema,
        start_staging_file_id: StagingFileId::new(
            row.try_get("start_staging_file_id").map_err(get_err)?,
        ),
        end_staging_file_id: StagingFileId::new(
            row.try_get("end_staging_file_id").map_err(get_err)?,
        ),
        first_event_at: row.try_get("first_event_at").map_err(get_err)?,
        last_event_at: row.try_get("last_event_at").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        timings,
        metadata: UploadMetadata {
            retry_count,
            priority: row.try_get("priority").map_err(get_err)?,
            next_retry_at: row.try_get("next_retry_at").map_err(get_err)?,
            load_file_type: LoadFileType::parse(&load_file_type)?,
        },
        error,
    })
}

fn table_upload_from_row(row: &PgRow) -> Result<TableUpload> {
    let get_err = |e| db_err("reading table upload row", e);
    let status: String = row.try_get("status").map_err(get_err)?;

    Ok(TableUpload {
        upload_id: UploadId::new(row.try_get("upload_id").map_err(get_err)?),
        table_name: row.try_get("table_name").map_err(get_err)?,
        status: TableUploadStatus::parse(&status)?,
        error: row.try_get("error").map_err(get_err)?,
        last_exec_at: row.try_get("last_exec_at").map_err(get_err)?,
        total_events: row.try_get("total_events").map_err(get_err)?,
        location: row.try_get("location").map_err(get_err)?,
        rows_inserted: row.try_get("rows_inserted").map_err(get_err)?,
        rows_updated: row.try_get("rows_updated").map_err(get_err)?,
    })
}

fn staging_file_from_row(row: &PgRow) -> Result<StagingFile> {
    let get_err = |e| db_err("reading staging file row", e);

    Ok(StagingFile {
        id: StagingFileId::new(row.try_get("id").map_err(get_err)?),
        source_id: SourceId::new(row.try_get::<String, _>("source_id").map_err(get_err)?),
        destination_id: DestinationId::new(
            row.try_get::<String, _>("destination_id").map_err(get_err)?,
        ),
        location: row.try_get("location").map_err(get_err)?,
        schema: json_column(row, "schema")?,
        total_events: row.try_get("total_events").map_err(get_err)?,
        size_bytes: row.try_get("size_bytes").map_err(get_err)?,
        first_event_at: row.try_get("first_event_at").map_err(get_err)?,
        last_event_at: row.try_get("last_event_at").map_err(get_err)?,
        created_at: row.try_get("created_at").map_err(get_err)?,
    })
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::Serialization {
        message: format!("encoding {what}: {e}"),
    })
}

/// Postgres-backed upload store.
pub struct PgUploadStore {
    pool: PgPool,
}

impl PgUploadStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UploadStore for PgUploadStore {
    async fn create(&self, draft: UploadDraft) -> Result<Upload> {
        let now = Utc::now();
        let timings = to_json(
            &vec![StatusTiming {
                status: UploadStatus::Waiting,
                at: now,
            }],
            "timings",
        )?;
        let schema = to_json(&draft.schema, "schema")?;

        let row = sqlx::query(
            "INSERT INTO wh_uploads (
                source_id, destination_id, destination_type, namespace, workspace_id,
                status, schema, start_staging_file_id, end_staging_file_id,
                first_event_at, last_event_at, priority, timings, created_at, updated_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$14)
            RETURNING *",
        )
        .bind(draft.source_id.as_str())
        .bind(draft.destination_id.as_str())
        .bind(draft.destination_type.as_str())
        .bind(&draft.namespace)
        .bind(draft.workspace_id.as_str())
        .bind(UploadStatus::Waiting.as_label())
        .bind(schema)
        .bind(draft.start_staging_file_id.get())
        .bind(draft.end_staging_file_id.get())
        .bind(draft.first_event_at)
        .bind(draft.last_event_at)
        .bind(draft.priority)
        .bind(timings)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let unique_violation = e
                .as_database_error()
                .and_then(|db| db.code())
                .is_some_and(|code| code == "23505");
            if unique_violation {
                Error::ActiveUploadExists {
                    source_id: draft.source_id.clone(),
                    destination_id: draft.destination_id.clone(),
                }
            } else {
                db_err("creating upload", e)
            }
        })?;

        upload_from_row(&row)
    }

    async fn get(&self, id: UploadId) -> Result<Option<Upload>> {
        let row = sqlx::query("SELECT * FROM wh_uploads WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("fetching upload", e))?;
        row.as_ref().map(upload_from_row).transpose()
    }

    async fn transition(
        &self,
        id: UploadId,
        from: UploadStatus,
        to: UploadStatus,
    ) -> Result<CasResult> {
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition { from, to });
        }

        let now = Utc::now();
        let timing = to_json(&StatusTiming { status: to, at: now }, "timing")?;
        let result = sqlx::query(
            "UPDATE wh_uploads
             SET status = $3, updated_at = $4, timings = timings || jsonb_build_array($5::jsonb)
             WHERE id = $1 AND status = $2",
        )
        .bind(id.get())
        .bind(from.as_label())
        .bind(to.as_label())
        .bind(now)
        .bind(timing)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("transitioning upload", e))?;

        if result.rows_affected() > 0 {
            return Ok(CasResult::Applied);
        }

        let actual: Option<String> = sqlx::query_scalar("SELECT status FROM wh_uploads WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("reading upload status", e))?;
        match actual {
            None => Ok(CasResult::NotFound),
            Some(actual) => Ok(CasResult::StateMismatch {
                actual: UploadStatus::parse(&actual)?,
            }),
        }
    }

    async fn append_error(&self, id: UploadId, status: UploadStatus, message: &str) -> Result<()> {
        sqlx::query(
            "UPDATE wh_uploads
             SET error = jsonb_set(
                     error,
                     ARRAY[$2],
                     COALESCE(error -> $2, '[]'::jsonb) || jsonb_build_array($3::jsonb)
                 ),
                 updated_at = $4
             WHERE id = $1",
        )
        .bind(id.get())
        .bind(status.as_label())
        .bind(json!(message))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("appending upload error", e))?;
        Ok(())
    }

    async fn set_merged_schema(&self, id: UploadId, schema: &Schema) -> Result<()> {
        sqlx::query("UPDATE wh_uploads SET merged_schema = $2, updated_at = $3 WHERE id = $1")
            .bind(id.get())
            .bind(to_json(schema, "merged schema")?)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("storing merged schema", e))?;
        Ok(())
    }

    async fn update_retry(
        &self,
        id: UploadId,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_uploads
             SET retry_count = $2, next_retry_at = $3, updated_at = $4
             WHERE id = $1",
        )
        .bind(id.get())
        .bind(i64::from(retry_count))
        .bind(next_retry_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("updating retry metadata", e))?;
        Ok(())
    }

    async fn last_created_at(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            "SELECT MAX(created_at) FROM wh_uploads
             WHERE source_id = $1 AND destination_id = $2",
        )
        .bind(source_id.as_str())
        .bind(destination_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("reading last upload time", e))
    }

    async fn last_staging_file_id(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<Option<StagingFileId>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(end_staging_file_id) FROM wh_uploads
             WHERE source_id = $1 AND destination_id = $2 AND status <> 'aborted'",
        )
        .bind(source_id.as_str())
        .bind(destination_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("reading claimed staging range", e))?;
        Ok(max.map(StagingFileId::new))
    }

    async fn pending(
        &self,
        destination_type: DestinationType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Upload>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM wh_uploads
             WHERE destination_type = $1
               AND status NOT IN {TERMINAL_STATUSES}
               AND status NOT IN {IN_PROGRESS_STATUSES}
               AND (next_retry_at IS NULL OR next_retry_at <= $2)
             ORDER BY priority ASC, created_at ASC, id ASC
             LIMIT $3"
        ))
        .bind(destination_type.as_str())
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("scanning pending uploads", e))?;

        rows.iter().map(upload_from_row).collect()
    }

    async fn interrupted(
        &self,
        destination_type: DestinationType,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<Vec<Upload>> {
        let threshold = now
            - chrono::Duration::from_std(liveness)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let rows = sqlx::query(&format!(
            "SELECT * FROM wh_uploads
             WHERE destination_type = $1
               AND status IN {IN_PROGRESS_STATUSES}
               AND updated_at <= $2
             ORDER BY id ASC"
        ))
        .bind(destination_type.as_str())
        .bind(threshold)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("scanning interrupted uploads", e))?;

        rows.iter().map(upload_from_row).collect()
    }

    async fn counts_by_status(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<BTreeMap<String, i64>> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM wh_uploads
             WHERE source_id = $1 AND destination_id = $2
             GROUP BY status",
        )
        .bind(source_id.as_str())
        .bind(destination_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("counting uploads", e))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| db_err("counting", e))?;
            let count: i64 = row.try_get("count").map_err(|e| db_err("counting", e))?;
            counts.insert(status, count);
        }
        Ok(counts)
    }
}

/// Postgres-backed table-upload store.
pub struct PgTableUploadStore {
    pool: PgPool,
}

impl PgTableUploadStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TableUploadStore for PgTableUploadStore {
    async fn create_many(&self, table_uploads: &[TableUpload]) -> Result<()> {
        for table_upload in table_uploads {
            sqlx::query(
                "INSERT INTO wh_table_uploads (upload_id, table_name, status, total_events, location)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (upload_id, table_name) DO NOTHING",
            )
            .bind(table_upload.upload_id.get())
            .bind(&table_upload.table_name)
            .bind(table_upload.status.as_label())
            .bind(table_upload.total_events)
            .bind(&table_upload.location)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("creating table uploads", e))?;
        }
        Ok(())
    }

    async fn for_upload(&self, upload_id: UploadId) -> Result<Vec<TableUpload>> {
        let rows = sqlx::query(
            "SELECT * FROM wh_table_uploads WHERE upload_id = $1 ORDER BY table_name ASC",
        )
        .bind(upload_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("fetching table uploads", e))?;

        rows.iter().map(table_upload_from_row).collect()
    }

    async fn set_location(
        &self,
        upload_id: UploadId,
        table_name: &str,
        location: &str,
        total_events: i64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_table_uploads SET location = $3, total_events = $4
             WHERE upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id.get())
        .bind(table_name)
        .bind(location)
        .bind(total_events)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("updating table upload location", e))?;
        Ok(())
    }

    async fn transition(
        &self,
        upload_id: UploadId,
        table_name: &str,
        status: TableUploadStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_table_uploads SET status = $3, error = $4, last_exec_at = $5
             WHERE upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id.get())
        .bind(table_name)
        .bind(status.as_label())
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("transitioning table upload", e))?;
        Ok(())
    }

    async fn mark_exported(
        &self,
        upload_id: UploadId,
        table_name: &str,
        rows_inserted: i64,
        rows_updated: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE wh_table_uploads
             SET status = 'exported_data', error = NULL, last_exec_at = $3,
                 rows_inserted = $4, rows_updated = $5
             WHERE upload_id = $1 AND table_name = $2",
        )
        .bind(upload_id.get())
        .bind(table_name)
        .bind(now)
        .bind(rows_inserted)
        .bind(rows_updated)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("marking table exported", e))?;
        Ok(())
    }
}

/// Postgres-backed staging-file store.
pub struct PgStagingFileStore {
    pool: PgPool,
}

impl PgStagingFileStore {
    /// Creates a store over the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StagingFileStore for PgStagingFileStore {
    async fn insert(&self, draft: StagingFileDraft) -> Result<StagingFile> {
        let row = sqlx::query(
            "INSERT INTO wh_staging_files (
                source_id, destination_id, location, schema, total_events,
                size_bytes, first_event_at, last_event_at, created_at
            ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            RETURNING *",
        )
        .bind(draft.source_id.as_str())
        .bind(draft.destination_id.as_str())
        .bind(&draft.location)
        .bind(to_json(&draft.schema, "staging schema")?)
        .bind(draft.total_events)
        .bind(draft.size_bytes)
        .bind(draft.first_event_at)
        .bind(draft.last_event_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_err("recording staging file", e))?;

        staging_file_from_row(&row)
    }

    async fn pending(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
        after: StagingFileId,
        max_files: usize,
    ) -> Result<Vec<StagingFile>> {
        let rows = sqlx::query(
            "SELECT * FROM wh_staging_files
             WHERE source_id = $1 AND destination_id = $2 AND id > $3
             ORDER BY id ASC
             LIMIT $4",
        )
        .bind(source_id.as_str())
        .bind(destination_id.as_str())
        .bind(after.get())
        .bind(i64::try_from(max_files).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("scanning staging files", e))?;

        rows.iter().map(staging_file_from_row).collect()
    }

    async fn in_range(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
        start: StagingFileId,
        end: StagingFileId,
    ) -> Result<Vec<StagingFile>> {
        let rows = sqlx::query(
            "SELECT * FROM wh_staging_files
             WHERE source_id = $1 AND destination_id = $2 AND id BETWEEN $3 AND $4
             ORDER BY id ASC",
        )
        .bind(source_id.as_str())
        .bind(destination_id.as_str())
        .bind(start.get())
        .bind(end.get())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("reading claimed staging files", e))?;

        rows.iter().map(staging_file_from_row).collect()
    }
}
