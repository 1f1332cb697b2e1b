//! Durable repositories for uploads, table uploads and staging files.
//!
//! The stores define the persistence layer of the control plane.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: upload status transitions use compare-and-set so
//!   exactly one worker owns an upload per phase
//! - **Scheduler-shaped queries**: pending/interrupted scans return work in
//!   the order the admission controller consumes it
//! - **Testability**: an in-memory implementation for tests, Postgres for
//!   production

pub mod memory;
pub mod postgres;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wharf_core::id::{DestinationId, SourceId, StagingFileId, UploadId, WorkspaceId};
use wharf_core::schema::Schema;
use wharf_core::warehouse::DestinationType;

use crate::error::Result;
use crate::staging::{StagingFile, StagingFileDraft};
use crate::upload::{TableUpload, TableUploadStatus, Upload, UploadStatus};

/// Result of a compare-and-set status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The transition was applied.
    Applied,
    /// The upload does not exist.
    NotFound,
    /// The status didn't match; another worker owns the upload.
    StateMismatch {
        /// The status actually found.
        actual: UploadStatus,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// An upload row before the repository assigns its id.
#[derive(Debug, Clone)]
pub struct UploadDraft {
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
    /// Union schema of the claimed staging files.
    pub schema: Schema,
    /// First staging file in the claimed range (inclusive).
    pub start_staging_file_id: StagingFileId,
    /// Last staging file in the claimed range (inclusive).
    pub end_staging_file_id: StagingFileId,
    /// Earliest event time across the claimed staging files.
    pub first_event_at: Option<DateTime<Utc>>,
    /// Latest event time across the claimed staging files.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Scheduling priority (lower = higher priority).
    pub priority: i32,
}

/// Durable store of uploads.
///
/// `transition` is the core primitive for distributed correctness: a
/// worker owns an upload for the duration of one phase exactly when its
/// compare-and-set succeeded.
#[async_trait]
pub trait UploadStore: Send + Sync {
    /// Creates an upload at status `waiting`, assigning the next monotonic
    /// id.
    ///
    /// # Errors
    ///
    /// Fails with [`crate::error::Error::ActiveUploadExists`] when a
    /// non-terminal upload exists for the same pair.
    async fn create(&self, draft: UploadDraft) -> Result<Upload>;

    /// Gets an upload by id.
    async fn get(&self, id: UploadId) -> Result<Option<Upload>>;

    /// Atomically transitions status if the current status matches `from`.
    ///
    /// On success the timing history gains an entry and `updated_at` is
    /// bumped (the liveness scan keys off it).
    async fn transition(&self, id: UploadId, from: UploadStatus, to: UploadStatus)
        -> Result<CasResult>;

    /// Appends an error message to the upload's history under `status`.
    async fn append_error(&self, id: UploadId, status: UploadStatus, message: &str) -> Result<()>;

    /// Stores the post-reconciliation schema.
    async fn set_merged_schema(&self, id: UploadId, schema: &Schema) -> Result<()>;

    /// Updates retry accounting after a failed attempt.
    async fn update_retry(
        &self,
        id: UploadId,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Returns when the pair's most recent upload was created.
    async fn last_created_at(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Returns the highest claimed staging-file id across the pair's
    /// non-aborted uploads; the scheduler claims from the next id up.
    async fn last_staging_file_id(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<Option<StagingFileId>>;

    /// Returns non-terminal uploads of the destination type whose retry
    /// timer has expired, ordered by (priority asc, created_at asc).
    async fn pending(
        &self,
        destination_type: DestinationType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Upload>>;

    /// Returns uploads stuck in an in-progress status whose `updated_at`
    /// is older than the liveness threshold; their owner is presumed dead
    /// and a new worker re-runs the interrupted phase.
    async fn interrupted(
        &self,
        destination_type: DestinationType,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<Vec<Upload>>;

    /// Returns upload counts by status label for the pair (admin surface).
    async fn counts_by_status(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<BTreeMap<String, i64>>;
}

/// Durable store of per-table sub-records.
#[async_trait]
pub trait TableUploadStore: Send + Sync {
    /// Creates table-upload rows, upserting by (upload, table) so the
    /// counts phase is re-runnable.
    async fn create_many(&self, table_uploads: &[TableUpload]) -> Result<()>;

    /// Returns the upload's table uploads, sorted by table name.
    async fn for_upload(&self, upload_id: UploadId) -> Result<Vec<TableUpload>>;

    /// Sets the resolved load-file location and event count.
    async fn set_location(
        &self,
        upload_id: UploadId,
        table_name: &str,
        location: &str,
        total_events: i64,
    ) -> Result<()>;

    /// Transitions a table upload, recording the error (if any) and the
    /// execution timestamp.
    async fn transition(
        &self,
        upload_id: UploadId,
        table_name: &str,
        status: TableUploadStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Marks a table exported with the driver's load result.
    async fn mark_exported(
        &self,
        upload_id: UploadId,
        table_name: &str,
        rows_inserted: i64,
        rows_updated: i64,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

/// Durable store of staging-file metadata rows.
#[async_trait]
pub trait StagingFileStore: Send + Sync {
    /// Records a staging file, assigning the next monotonic id.
    async fn insert(&self, draft: StagingFileDraft) -> Result<StagingFile>;

    /// Returns up to `max_files` unclaimed staging files of the pair with
    /// ids strictly greater than `after`, in id order (which preserves
    /// event-time order across batches).
    async fn pending(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
        after: StagingFileId,
        max_files: usize,
    ) -> Result<Vec<StagingFile>>;

    /// Returns the staging files in the inclusive id range.
    async fn in_range(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
        start: StagingFileId,
        end: StagingFileId,
    ) -> Result<Vec<StagingFile>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_applied() {
        assert!(CasResult::Applied.is_applied());
        assert!(!CasResult::NotFound.is_applied());
        assert!(!CasResult::StateMismatch {
            actual: UploadStatus::ExportingData
        }
        .is_applied());
    }
}
