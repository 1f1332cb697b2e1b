//! Upload and table-upload state machines.
//!
//! An upload is the durable record of one ingestion cycle for one
//! warehouse. Its status advances only forward through ordered phases;
//! in-progress phases alternate with durable checkpoints so an interrupted
//! worker can be replaced and the next owner resumes from the last
//! checkpoint:
//!
//! ```text
//! WAITING ──► GENERATING_LOAD_FILES ──► GENERATED_LOAD_FILES
//!                                              │
//!             UPDATED_TABLE_UPLOADS_COUNTS ◄── UPDATING_TABLE_UPLOADS_COUNTS
//!                       │
//!                       ▼
//!             CREATING_REMOTE_SCHEMA ──► CREATED_REMOTE_SCHEMA
//!                                              │
//!                        EXPORTED_DATA ◄── EXPORTING_DATA
//!
//! any non-terminal ──► FAILED (retry with backoff) ──► back to the phase
//!                                                      after the last
//!                                                      checkpoint
//! any non-terminal ──► ABORTED (attempts exhausted or non-retryable)
//! ```
//!
//! `EXPORTED_DATA` and `ABORTED` are terminal. `FAILED` is not: it parks
//! the upload until its retry timer expires.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wharf_core::id::{DestinationId, SourceId, StagingFileId, UploadId, WorkspaceId};
use wharf_core::schema::Schema;
use wharf_core::warehouse::DestinationType;

use crate::error::{Error, Result};

/// Upload lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Created by the scheduler, waiting for a worker.
    Waiting,
    /// Producing per-table load files from staging files.
    GeneratingLoadFiles,
    /// Load files are in object storage.
    GeneratedLoadFiles,
    /// Creating table-upload rows and aggregating per-table counts.
    UpdatingTableUploadsCounts,
    /// Table-upload rows and counts are persisted.
    UpdatedTableUploadsCounts,
    /// Fetching and reconciling the remote schema.
    CreatingRemoteSchema,
    /// Remote schema matches the upload (additively).
    CreatedRemoteSchema,
    /// Loading tables through the warehouse driver.
    ExportingData,
    /// All tables loaded. Terminal.
    ExportedData,
    /// Retry attempts exhausted or a non-retryable error. Terminal.
    Aborted,
    /// A phase failed; parked until the retry timer expires.
    Failed,
}

impl UploadStatus {
    /// Returns the stable snake_case label used in persistence, the error
    /// history and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::GeneratingLoadFiles => "generating_load_files",
            Self::GeneratedLoadFiles => "generated_load_files",
            Self::UpdatingTableUploadsCounts => "updating_table_uploads_counts",
            Self::UpdatedTableUploadsCounts => "updated_table_uploads_counts",
            Self::CreatingRemoteSchema => "creating_remote_schema",
            Self::CreatedRemoteSchema => "created_remote_schema",
            Self::ExportingData => "exporting_data",
            Self::ExportedData => "exported_data",
            Self::Aborted => "aborted",
            Self::Failed => "failed",
        }
    }

    /// Parses the stable label back into a status.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown labels.
    pub fn parse(label: &str) -> Result<Self> {
        match label {
            "waiting" => Ok(Self::Waiting),
            "generating_load_files" => Ok(Self::GeneratingLoadFiles),
            "generated_load_files" => Ok(Self::GeneratedLoadFiles),
            "updating_table_uploads_counts" => Ok(Self::UpdatingTableUploadsCounts),
            "updated_table_uploads_counts" => Ok(Self::UpdatedTableUploadsCounts),
            "creating_remote_schema" => Ok(Self::CreatingRemoteSchema),
            "created_remote_schema" => Ok(Self::CreatedRemoteSchema),
            "exporting_data" => Ok(Self::ExportingData),
            "exported_data" => Ok(Self::ExportedData),
            "aborted" => Ok(Self::Aborted),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Serialization {
                message: format!("unknown upload status: {other}"),
            }),
        }
    }

    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ExportedData | Self::Aborted)
    }

    /// Returns true for statuses that mean a worker owns the upload and is
    /// executing a phase.
    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        matches!(
            self,
            Self::GeneratingLoadFiles
                | Self::UpdatingTableUploadsCounts
                | Self::CreatingRemoteSchema
                | Self::ExportingData
        )
    }

    /// Returns true for durable checkpoints (including `Waiting` and the
    /// terminal `ExportedData`).
    #[must_use]
    pub const fn is_checkpoint(&self) -> bool {
        matches!(
            self,
            Self::Waiting
                | Self::GeneratedLoadFiles
                | Self::UpdatedTableUploadsCounts
                | Self::CreatedRemoteSchema
                | Self::ExportedData
        )
    }

    /// Returns the next status on the forward chain, or `None` at the end.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Waiting => Some(Self::GeneratingLoadFiles),
            Self::GeneratingLoadFiles => Some(Self::GeneratedLoadFiles),
            Self::GeneratedLoadFiles => Some(Self::UpdatingTableUploadsCounts),
            Self::UpdatingTableUploadsCounts => Some(Self::UpdatedTableUploadsCounts),
            Self::UpdatedTableUploadsCounts => Some(Self::CreatingRemoteSchema),
            Self::CreatingRemoteSchema => Some(Self::CreatedRemoteSchema),
            Self::CreatedRemoteSchema => Some(Self::ExportingData),
            Self::ExportingData => Some(Self::ExportedData),
            Self::ExportedData | Self::Aborted | Self::Failed => None,
        }
    }

    /// For an in-progress status, the checkpoint it completes into.
    #[must_use]
    pub const fn completed(&self) -> Option<Self> {
        if self.is_in_progress() {
            self.next()
        } else {
            None
        }
    }

    /// Returns true if the transition from self to `target` is valid.
    ///
    /// Forward steps follow the chain; `Aborted` is reachable from any
    /// non-terminal status; `Failed` from any in-progress status; and a
    /// failed upload resumes into any in-progress status (the runner picks
    /// the one after the last checkpoint).
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target == Self::Aborted {
            return true;
        }
        if target == Self::Failed {
            return self.is_in_progress();
        }
        if *self == Self::Failed {
            return target.is_in_progress();
        }
        self.next() == Some(target)
    }
}

impl Default for UploadStatus {
    fn default() -> Self {
        Self::Waiting
    }
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Format of generated load files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadFileType {
    /// Gzipped headerless CSV (the default for every reference driver).
    #[default]
    Csv,
    /// Gzipped newline-delimited JSON (accepted by some cloud warehouses).
    Json,
}

impl LoadFileType {
    /// Returns the stable label used in persistence.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    /// Parses the stable label back into a load-file type.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown labels.
    pub fn parse(label: &str) -> Result<Self> {
        match label {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(Error::Serialization {
                message: format!("unknown load file type: {other}"),
            }),
        }
    }
}

/// One entry of the upload's ordered timing history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusTiming {
    /// Status entered.
    pub status: UploadStatus,
    /// When it was entered.
    pub at: DateTime<Utc>,
}

/// Retry and priority metadata carried on the upload row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Scheduling priority (lower = higher priority).
    #[serde(default)]
    pub priority: i32,
    /// Earliest instant the next attempt may start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Format of the generated load files.
    #[serde(default)]
    pub load_file_type: LoadFileType,
}

/// The durable record of one ingestion cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upload {
    /// Repository-assigned monotonic id.
    pub id: UploadId,
    /// Source side of the pair.
    pub source_id: SourceId,
    /// Destination side of the pair.
    pub destination_id: DestinationId,
    /// Destination type tag.
    pub destination_type: DestinationType,
    /// Target schema name.
    pub namespace: String,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Current status.
    pub status: UploadStatus,
    /// Upload-time schema snapshot (union of the claimed staging files).
    pub schema: Schema,
    /// Post-reconciliation schema, set by the remote-schema phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_schema: Option<Schema>,
    /// First staging file in the claimed range (inclusive).
    pub start_staging_file_id: StagingFileId,
    /// Last staging file in the claimed range (inclusive).
    pub end_staging_file_id: StagingFileId,
    /// Earliest event time across the claimed staging files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_at: Option<DateTime<Utc>>,
    /// Latest event time across the claimed staging files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    /// When the upload row was created.
    pub created_at: DateTime<Utc>,
    /// When the upload row last changed; the liveness scan keys off this.
    pub updated_at: DateTime<Utc>,
    /// Ordered status history.
    #[serde(default)]
    pub timings: Vec<StatusTiming>,
    /// Retry and priority metadata.
    #[serde(default)]
    pub metadata: UploadMetadata,
    /// Ordered error history, keyed by the status label the error occurred
    /// in.
    #[serde(default)]
    pub error: BTreeMap<String, Vec<String>>,
}

impl Upload {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the most recent durable checkpoint from the timing history.
    ///
    /// Every upload has at least the `Waiting` entry recorded at creation.
    #[must_use]
    pub fn last_checkpoint(&self) -> UploadStatus {
        self.timings
            .iter()
            .rev()
            .map(|t| t.status)
            .find(UploadStatus::is_checkpoint)
            .unwrap_or(UploadStatus::Waiting)
    }

    /// Returns the in-progress phase a worker should (re)run, or `None`
    /// when the upload is terminal.
    ///
    /// - a checkpoint resumes into the phase after it
    /// - an in-progress status is re-run (the previous owner died mid-phase;
    ///   every phase is idempotent)
    /// - a failed upload resumes after its last checkpoint
    #[must_use]
    pub fn resume_point(&self) -> Option<UploadStatus> {
        match self.status {
            s if s.is_terminal() => None,
            s if s.is_in_progress() => Some(s),
            UploadStatus::Failed => self.last_checkpoint().next(),
            s => s.next(),
        }
    }

    /// Returns true once the retry timer allows another attempt.
    #[must_use]
    pub fn is_retry_due_at(&self, now: DateTime<Utc>) -> bool {
        self.metadata
            .next_retry_at
            .is_none_or(|retry_at| now >= retry_at)
    }

    /// Appends an error message under the given status label.
    pub fn append_error(&mut self, status: UploadStatus, message: impl Into<String>) {
        self.error
            .entry(status.as_label().to_string())
            .or_default()
            .push(message.into());
    }

    /// Returns the most recent error message, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        // The timing history orders states; take the newest state that has
        // errors and return its last message.
        self.timings
            .iter()
            .rev()
            .filter_map(|t| self.error.get(t.status.as_label()))
            .find_map(|errors| errors.last())
            .map(String::as_str)
            .or_else(|| {
                self.error
                    .values()
                    .next_back()
                    .and_then(|errors| errors.last())
                    .map(String::as_str)
            })
    }
}

/// Table-upload lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableUploadStatus {
    /// Created, not yet loaded.
    #[default]
    Waiting,
    /// The driver is loading the table.
    ExportingData,
    /// Loaded. Terminal.
    ExportedData,
    /// The last load attempt failed; retried with the upload.
    Failed,
    /// Attempts exhausted or a table-level schema conflict. Terminal.
    Aborted,
}

impl TableUploadStatus {
    /// Returns the stable snake_case label.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::ExportingData => "exporting_data",
            Self::ExportedData => "exported_data",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parses the stable label back into a status.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown labels.
    pub fn parse(label: &str) -> Result<Self> {
        match label {
            "waiting" => Ok(Self::Waiting),
            "exporting_data" => Ok(Self::ExportingData),
            "exported_data" => Ok(Self::ExportedData),
            "failed" => Ok(Self::Failed),
            "aborted" => Ok(Self::Aborted),
            other => Err(Error::Serialization {
                message: format!("unknown table upload status: {other}"),
            }),
        }
    }

    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::ExportedData | Self::Aborted)
    }
}

impl std::fmt::Display for TableUploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Per-table sub-record of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableUpload {
    /// Parent upload.
    pub upload_id: UploadId,
    /// Destination table.
    pub table_name: String,
    /// Current status.
    pub status: TableUploadStatus,
    /// Last load error, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the table was last loaded (or attempted).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exec_at: Option<DateTime<Utc>>,
    /// Events staged for this table.
    pub total_events: i64,
    /// Resolved load-file prefix (the primary part's key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Rows inserted by the last successful load.
    #[serde(default)]
    pub rows_inserted: i64,
    /// Rows updated by the last successful load.
    #[serde(default)]
    pub rows_updated: i64,
}

impl TableUpload {
    /// Creates a waiting table upload.
    #[must_use]
    pub fn new(upload_id: UploadId, table_name: impl Into<String>, total_events: i64) -> Self {
        Self {
            upload_id,
            table_name: table_name.into(),
            status: TableUploadStatus::Waiting,
            error: None,
            last_exec_at: None,
            total_events,
            location: None,
            rows_inserted: 0,
            rows_updated: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_with_status(status: UploadStatus, timings: &[UploadStatus]) -> Upload {
        let now = Utc::now();
        Upload {
            id: UploadId::new(1),
            source_id: SourceId::new("src"),
            destination_id: DestinationId::new("dst"),
            destination_type: DestinationType::Postgres,
            namespace: "analytics".into(),
            workspace_id: WorkspaceId::new("ws"),
            status,
            schema: Schema::new(),
            merged_schema: None,
            start_staging_file_id: StagingFileId::new(1),
            end_staging_file_id: StagingFileId::new(3),
            first_event_at: None,
            last_event_at: None,
            created_at: now,
            updated_at: now,
            timings: timings
                .iter()
                .map(|s| StatusTiming { status: *s, at: now })
                .collect(),
            metadata: UploadMetadata::default(),
            error: BTreeMap::new(),
        }
    }

    #[test]
    fn forward_chain_covers_every_phase() {
        let mut status = UploadStatus::Waiting;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            seen.push(next);
            status = next;
        }
        assert_eq!(status, UploadStatus::ExportedData);
        assert_eq!(seen.len(), 9);
    }

    #[test]
    fn in_progress_and_checkpoint_alternate() {
        let mut status = UploadStatus::Waiting;
        while let Some(next) = status.next() {
            if status.is_checkpoint() && !status.is_terminal() {
                assert!(next.is_in_progress(), "{status} -> {next}");
            }
            if status.is_in_progress() {
                assert!(next.is_checkpoint(), "{status} -> {next}");
                assert_eq!(status.completed(), Some(next));
            }
            status = next;
        }
    }

    #[test]
    fn status_advances_only_forward() {
        assert!(UploadStatus::Waiting.can_transition_to(UploadStatus::GeneratingLoadFiles));
        assert!(!UploadStatus::Waiting.can_transition_to(UploadStatus::ExportingData));
        assert!(
            !UploadStatus::GeneratedLoadFiles.can_transition_to(UploadStatus::GeneratingLoadFiles)
        );
    }

    #[test]
    fn aborted_is_reachable_from_any_non_terminal() {
        for status in [
            UploadStatus::Waiting,
            UploadStatus::GeneratingLoadFiles,
            UploadStatus::CreatedRemoteSchema,
            UploadStatus::ExportingData,
            UploadStatus::Failed,
        ] {
            assert!(status.can_transition_to(UploadStatus::Aborted), "{status}");
        }
        assert!(!UploadStatus::ExportedData.can_transition_to(UploadStatus::Aborted));
    }

    #[test]
    fn terminal_statuses_allow_no_transitions() {
        for target in [
            UploadStatus::Waiting,
            UploadStatus::Failed,
            UploadStatus::Aborted,
            UploadStatus::ExportingData,
        ] {
            assert!(!UploadStatus::ExportedData.can_transition_to(target));
            assert!(!UploadStatus::Aborted.can_transition_to(target));
        }
    }

    #[test]
    fn failed_resumes_into_in_progress_only() {
        assert!(UploadStatus::Failed.can_transition_to(UploadStatus::ExportingData));
        assert!(UploadStatus::Failed.can_transition_to(UploadStatus::GeneratingLoadFiles));
        assert!(!UploadStatus::Failed.can_transition_to(UploadStatus::GeneratedLoadFiles));
        assert!(!UploadStatus::Failed.can_transition_to(UploadStatus::ExportedData));
    }

    #[test]
    fn status_labels_roundtrip() {
        for status in [
            UploadStatus::Waiting,
            UploadStatus::GeneratingLoadFiles,
            UploadStatus::GeneratedLoadFiles,
            UploadStatus::UpdatingTableUploadsCounts,
            UploadStatus::UpdatedTableUploadsCounts,
            UploadStatus::CreatingRemoteSchema,
            UploadStatus::CreatedRemoteSchema,
            UploadStatus::ExportingData,
            UploadStatus::ExportedData,
            UploadStatus::Aborted,
            UploadStatus::Failed,
        ] {
            assert_eq!(UploadStatus::parse(status.as_label()).unwrap(), status);
        }
        assert!(UploadStatus::parse("exporting").is_err());
    }

    #[test]
    fn fresh_upload_resumes_into_generation() {
        let upload = upload_with_status(UploadStatus::Waiting, &[UploadStatus::Waiting]);
        assert_eq!(
            upload.resume_point(),
            Some(UploadStatus::GeneratingLoadFiles)
        );
    }

    #[test]
    fn interrupted_phase_is_rerun() {
        let upload = upload_with_status(
            UploadStatus::ExportingData,
            &[
                UploadStatus::Waiting,
                UploadStatus::GeneratingLoadFiles,
                UploadStatus::GeneratedLoadFiles,
                UploadStatus::ExportingData,
            ],
        );
        assert_eq!(upload.resume_point(), Some(UploadStatus::ExportingData));
    }

    #[test]
    fn failed_upload_resumes_after_last_checkpoint() {
        let upload = upload_with_status(
            UploadStatus::Failed,
            &[
                UploadStatus::Waiting,
                UploadStatus::GeneratingLoadFiles,
                UploadStatus::GeneratedLoadFiles,
                UploadStatus::UpdatingTableUploadsCounts,
                UploadStatus::Failed,
            ],
        );
        // Last checkpoint was GeneratedLoadFiles: re-run the counts phase.
        assert_eq!(
            upload.resume_point(),
            Some(UploadStatus::UpdatingTableUploadsCounts)
        );
    }

    #[test]
    fn terminal_upload_has_no_resume_point() {
        let upload = upload_with_status(UploadStatus::ExportedData, &[UploadStatus::Waiting]);
        assert_eq!(upload.resume_point(), None);
    }

    #[test]
    fn retry_timer_gates_resume() {
        let now = Utc::now();
        let mut upload = upload_with_status(UploadStatus::Failed, &[UploadStatus::Waiting]);
        assert!(upload.is_retry_due_at(now));

        upload.metadata.next_retry_at = Some(now + chrono::Duration::seconds(60));
        assert!(!upload.is_retry_due_at(now));
        assert!(upload.is_retry_due_at(now + chrono::Duration::seconds(61)));
    }

    #[test]
    fn error_history_preserves_order() {
        let mut upload = upload_with_status(
            UploadStatus::Failed,
            &[UploadStatus::Waiting, UploadStatus::ExportingData],
        );
        upload.append_error(UploadStatus::ExportingData, "first");
        upload.append_error(UploadStatus::ExportingData, "second");

        assert_eq!(
            upload.error.get("exporting_data").map(Vec::as_slice),
            Some(["first".to_string(), "second".to_string()].as_slice())
        );
        assert_eq!(upload.last_error(), Some("second"));
    }

    #[test]
    fn table_upload_status_labels_roundtrip() {
        for status in [
            TableUploadStatus::Waiting,
            TableUploadStatus::ExportingData,
            TableUploadStatus::ExportedData,
            TableUploadStatus::Failed,
            TableUploadStatus::Aborted,
        ] {
            assert_eq!(TableUploadStatus::parse(status.as_label()).unwrap(), status);
        }
    }
}
