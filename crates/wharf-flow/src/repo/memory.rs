//! In-memory store implementations for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no durability, no cross-process
//!   coordination
//! - **Single-process only**: state is lost when the process exits

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use wharf_core::id::{DestinationId, SourceId, StagingFileId, UploadId};
use wharf_core::schema::Schema;
use wharf_core::warehouse::DestinationType;

use super::{CasResult, StagingFileStore, TableUploadStore, UploadDraft, UploadStore};
use crate::error::{Error, Result};
use crate::staging::{StagingFile, StagingFileDraft};
use crate::upload::{
    StatusTiming, TableUpload, TableUploadStatus, Upload, UploadMetadata, UploadStatus,
};

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

#[derive(Debug, Default)]
struct UploadsInner {
    next_id: i64,
    uploads: BTreeMap<i64, Upload>,
}

/// In-memory upload store.
#[derive(Debug, Default)]
pub struct InMemoryUploadStore {
    inner: RwLock<UploadsInner>,
}

impl InMemoryUploadStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of uploads currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn upload_count(&self) -> Result<usize> {
        Ok(self.inner.read().map_err(poison_err)?.uploads.len())
    }
}

#[async_trait]
impl UploadStore for InMemoryUploadStore {
    async fn create(&self, draft: UploadDraft) -> Result<Upload> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let active_exists = inner.uploads.values().any(|u| {
            u.source_id == draft.source_id
                && u.destination_id == draft.destination_id
                && !u.is_terminal()
        });
        if active_exists {
            return Err(Error::ActiveUploadExists {
                source_id: draft.source_id,
                destination_id: draft.destination_id,
            });
        }

        inner.next_id += 1;
        let now = Utc::now();
        let upload = Upload {
            id: UploadId::new(inner.next_id),
            source_id: draft.source_id,
            destination_id: draft.destination_id,
            destination_type: draft.destination_type,
            namespace: draft.namespace,
            workspace_id: draft.workspace_id,
            status: UploadStatus::Waiting,
            schema: draft.schema,
            merged_schema: None,
            start_staging_file_id: draft.start_staging_file_id,
            end_staging_file_id: draft.end_staging_file_id,
            first_event_at: draft.first_event_at,
            last_event_at: draft.last_event_at,
            created_at: now,
            updated_at: now,
            timings: vec![StatusTiming {
                status: UploadStatus::Waiting,
                at: now,
            }],
            metadata: UploadMetadata {
                priority: draft.priority,
                ..UploadMetadata::default()
            },
            error: BTreeMap::new(),
        };
        inner.uploads.insert(upload.id.get(), upload.clone());
        Ok(upload)
    }

    async fn get(&self, id: UploadId) -> Result<Option<Upload>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner.uploads.get(&id.get()).cloned())
    }

    async fn transition(
        &self,
        id: UploadId,
        from: UploadStatus,
        to: UploadStatus,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let Some(upload) = inner.uploads.get_mut(&id.get()) else {
            return Ok(CasResult::NotFound);
        };
        if upload.status != from {
            return Ok(CasResult::StateMismatch {
                actual: upload.status,
            });
        }
        if !from.can_transition_to(to) {
            return Err(Error::InvalidStateTransition { from, to });
        }

        let now = Utc::now();
        upload.status = to;
        upload.updated_at = now;
        upload.timings.push(StatusTiming { status: to, at: now });
        Ok(CasResult::Applied)
    }

    async fn append_error(&self, id: UploadId, status: UploadStatus, message: &str) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let upload = inner
            .uploads
            .get_mut(&id.get())
            .ok_or(Error::UploadNotFound { id })?;
        upload.append_error(status, message);
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn set_merged_schema(&self, id: UploadId, schema: &Schema) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let upload = inner
            .uploads
            .get_mut(&id.get())
            .ok_or(Error::UploadNotFound { id })?;
        upload.merged_schema = Some(schema.clone());
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn update_retry(
        &self,
        id: UploadId,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let upload = inner
            .uploads
            .get_mut(&id.get())
            .ok_or(Error::UploadNotFound { id })?;
        upload.metadata.retry_count = retry_count;
        upload.metadata.next_retry_at = next_retry_at;
        upload.updated_at = Utc::now();
        Ok(())
    }

    async fn last_created_at(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .uploads
            .values()
            .filter(|u| u.source_id == *source_id && u.destination_id == *destination_id)
            .map(|u| u.created_at)
            .max())
    }

    async fn last_staging_file_id(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<Option<StagingFileId>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .uploads
            .values()
            .filter(|u| {
                u.source_id == *source_id
                    && u.destination_id == *destination_id
                    && u.status != UploadStatus::Aborted
            })
            .map(|u| u.end_staging_file_id)
            .max())
    }

    async fn pending(
        &self,
        destination_type: DestinationType,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Upload>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut pending: Vec<Upload> = inner
            .uploads
            .values()
            .filter(|u| {
                u.destination_type == destination_type
                    && !u.is_terminal()
                    && !u.status.is_in_progress()
                    && u.is_retry_due_at(now)
            })
            .cloned()
            .collect();

        pending.sort_by(|a, b| {
            a.metadata
                .priority
                .cmp(&b.metadata.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        Ok(pending)
    }

    async fn interrupted(
        &self,
        destination_type: DestinationType,
        now: DateTime<Utc>,
        liveness: Duration,
    ) -> Result<Vec<Upload>> {
        let threshold =
            chrono::Duration::from_std(liveness).unwrap_or_else(|_| chrono::Duration::minutes(10));
        let inner = self.inner.read().map_err(poison_err)?;
        let mut stuck: Vec<Upload> = inner
            .uploads
            .values()
            .filter(|u| {
                u.destination_type == destination_type
                    && u.status.is_in_progress()
                    && now.signed_duration_since(u.updated_at) >= threshold
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|u| u.id);
        Ok(stuck)
    }

    async fn counts_by_status(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
    ) -> Result<BTreeMap<String, i64>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut counts = BTreeMap::new();
        for upload in inner.uploads.values() {
            if upload.source_id == *source_id && upload.destination_id == *destination_id {
                *counts
                    .entry(upload.status.as_label().to_string())
                    .or_default() += 1;
            }
        }
        Ok(counts)
    }
}

/// In-memory table-upload store.
#[derive(Debug, Default)]
pub struct InMemoryTableUploadStore {
    rows: RwLock<BTreeMap<(i64, String), TableUpload>>,
}

impl InMemoryTableUploadStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableUploadStore for InMemoryTableUploadStore {
    async fn create_many(&self, table_uploads: &[TableUpload]) -> Result<()> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        for table_upload in table_uploads {
            let key = (table_upload.upload_id.get(), table_upload.table_name.clone());
            // Upsert keeps the counts phase re-runnable without clobbering
            // a table that already exported.
            match rows.get(&key) {
                Some(existing) if existing.status.is_terminal() => {}
                _ => {
                    rows.insert(key, table_upload.clone());
                }
            }
        }
        Ok(())
    }

    async fn for_upload(&self, upload_id: UploadId) -> Result<Vec<TableUpload>> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows
            .values()
            .filter(|t| t.upload_id == upload_id)
            .cloned()
            .collect())
    }

    async fn set_location(
        &self,
        upload_id: UploadId,
        table_name: &str,
        location: &str,
        total_events: i64,
    ) -> Result<()> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        if let Some(row) = rows.get_mut(&(upload_id.get(), table_name.to_string())) {
            row.location = Some(location.to_string());
            row.total_events = total_events;
        }
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
        let mut rows = self.rows.write().map_err(poison_err)?;
        if let Some(row) = rows.get_mut(&(upload_id.get(), table_name.to_string())) {
            row.status = status;
            row.error = error.map(str::to_string);
            row.last_exec_at = Some(now);
        }
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
        let mut rows = self.rows.write().map_err(poison_err)?;
        if let Some(row) = rows.get_mut(&(upload_id.get(), table_name.to_string())) {
            row.status = TableUploadStatus::ExportedData;
            row.error = None;
            row.last_exec_at = Some(now);
            row.rows_inserted = rows_inserted;
            row.rows_updated = rows_updated;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StagingInner {
    next_id: i64,
    files: BTreeMap<i64, StagingFile>,
}

/// In-memory staging-file store.
#[derive(Debug, Default)]
pub struct InMemoryStagingFileStore {
    inner: RwLock<StagingInner>,
}

impl InMemoryStagingFileStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingFileStore for InMemoryStagingFileStore {
    async fn insert(&self, draft: StagingFileDraft) -> Result<StagingFile> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.next_id += 1;
        let file = StagingFile {
            id: StagingFileId::new(inner.next_id),
            source_id: draft.source_id,
            destination_id: draft.destination_id,
            location: draft.location,
            schema: draft.schema,
            total_events: draft.total_events,
            size_bytes: draft.size_bytes,
            first_event_at: draft.first_event_at,
            last_event_at: draft.last_event_at,
            created_at: Utc::now(),
        };
        inner.files.insert(file.id.get(), file.clone());
        Ok(file)
    }

    async fn pending(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
        after: StagingFileId,
        max_files: usize,
    ) -> Result<Vec<StagingFile>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .files
            .values()
            .filter(|f| {
                f.source_id == *source_id
                    && f.destination_id == *destination_id
                    && f.id > after
            })
            .take(max_files)
            .cloned()
            .collect())
    }

    async fn in_range(
        &self,
        source_id: &SourceId,
        destination_id: &DestinationId,
        start: StagingFileId,
        end: StagingFileId,
    ) -> Result<Vec<StagingFile>> {
        let inner = self.inner.read().map_err(poison_err)?;
        Ok(inner
            .files
            .values()
            .filter(|f| {
                f.source_id == *source_id
                    && f.destination_id == *destination_id
                    && f.id >= start
                    && f.id <= end
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> UploadDraft {
        UploadDraft {
            source_id: SourceId::new("src"),
            destination_id: DestinationId::new("dst"),
            destination_type: DestinationType::Postgres,
            namespace: "analytics".into(),
            workspace_id: wharf_core::id::WorkspaceId::new("ws"),
            schema: Schema::new(),
            start_staging_file_id: StagingFileId::new(1),
            end_staging_file_id: StagingFileId::new(3),
            first_event_at: None,
            last_event_at: None,
            priority: 0,
        }
    }

    fn staging_draft(n: i64) -> StagingFileDraft {
        StagingFileDraft {
            source_id: SourceId::new("src"),
            destination_id: DestinationId::new("dst"),
            location: format!("staging/{n}"),
            schema: Schema::new(),
            total_events: n,
            size_bytes: 100,
            first_event_at: None,
            last_event_at: None,
        }
    }

    #[tokio::test]
    async fn create_assigns_monotonic_ids() {
        let store = InMemoryUploadStore::new();
        let first = store.create(draft()).await.unwrap();
        store
            .transition(first.id, UploadStatus::Waiting, UploadStatus::Aborted)
            .await
            .unwrap();
        let second = store.create(draft()).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn second_active_upload_for_pair_is_rejected() {
        let store = InMemoryUploadStore::new();
        store.create(draft()).await.unwrap();
        let err = store.create(draft()).await.unwrap_err();
        assert!(matches!(err, Error::ActiveUploadExists { .. }));
    }

    #[tokio::test]
    async fn terminal_upload_frees_the_pair() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();
        store
            .transition(upload.id, UploadStatus::Waiting, UploadStatus::Aborted)
            .await
            .unwrap();
        assert!(store.create(draft()).await.is_ok());
    }

    #[tokio::test]
    async fn transition_cas_applies_and_records_timing() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();

        let result = store
            .transition(
                upload.id,
                UploadStatus::Waiting,
                UploadStatus::GeneratingLoadFiles,
            )
            .await
            .unwrap();
        assert!(result.is_applied());

        let updated = store.get(upload.id).await.unwrap().unwrap();
        assert_eq!(updated.status, UploadStatus::GeneratingLoadFiles);
        assert_eq!(updated.timings.len(), 2);
        assert!(updated.updated_at >= upload.updated_at);
    }

    #[tokio::test]
    async fn transition_cas_detects_mismatch() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();

        let result = store
            .transition(
                upload.id,
                UploadStatus::GeneratingLoadFiles,
                UploadStatus::GeneratedLoadFiles,
            )
            .await
            .unwrap();
        assert_eq!(
            result,
            CasResult::StateMismatch {
                actual: UploadStatus::Waiting
            }
        );
    }

    #[tokio::test]
    async fn transition_rejects_invalid_target() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();

        let result = store
            .transition(upload.id, UploadStatus::Waiting, UploadStatus::ExportedData)
            .await;
        assert!(matches!(
            result,
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn pending_respects_retry_timer_and_order() {
        let store = InMemoryUploadStore::new();
        let now = Utc::now();

        let first = store.create(draft()).await.unwrap();
        // Park the first upload in Failed with a future retry.
        store
            .transition(
                first.id,
                UploadStatus::Waiting,
                UploadStatus::GeneratingLoadFiles,
            )
            .await
            .unwrap();
        store
            .transition(
                first.id,
                UploadStatus::GeneratingLoadFiles,
                UploadStatus::Failed,
            )
            .await
            .unwrap();
        store
            .update_retry(first.id, 1, Some(now + chrono::Duration::minutes(5)))
            .await
            .unwrap();

        let mut other = draft();
        other.destination_id = DestinationId::new("dst-2");
        let second = store.create(other).await.unwrap();

        let pending = store
            .pending(DestinationType::Postgres, now, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, second.id);

        // Once the timer expires the failed upload is pending again.
        let later = now + chrono::Duration::minutes(6);
        let pending = store
            .pending(DestinationType::Postgres, later, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id, "older upload first");
    }

    #[tokio::test]
    async fn interrupted_detects_stale_in_progress_uploads() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();
        store
            .transition(
                upload.id,
                UploadStatus::Waiting,
                UploadStatus::ExportingData,
            )
            .await
            .unwrap();

        // Fresh in-progress upload: not interrupted.
        let none = store
            .interrupted(DestinationType::Postgres, Utc::now(), Duration::from_secs(600))
            .await
            .unwrap();
        assert!(none.is_empty());

        // Past the liveness threshold the owner is presumed dead.
        let later = Utc::now() + chrono::Duration::minutes(11);
        let stuck = store
            .interrupted(DestinationType::Postgres, later, Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, upload.id);
    }

    #[tokio::test]
    async fn last_staging_file_id_ignores_aborted_uploads() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();
        assert_eq!(
            store
                .last_staging_file_id(&SourceId::new("src"), &DestinationId::new("dst"))
                .await
                .unwrap(),
            Some(StagingFileId::new(3))
        );

        store
            .transition(upload.id, UploadStatus::Waiting, UploadStatus::Aborted)
            .await
            .unwrap();
        assert_eq!(
            store
                .last_staging_file_id(&SourceId::new("src"), &DestinationId::new("dst"))
                .await
                .unwrap(),
            None,
            "aborted ranges are reclaimable"
        );
    }

    #[tokio::test]
    async fn counts_by_status_groups_by_label() {
        let store = InMemoryUploadStore::new();
        let upload = store.create(draft()).await.unwrap();
        store
            .transition(upload.id, UploadStatus::Waiting, UploadStatus::Aborted)
            .await
            .unwrap();
        store.create(draft()).await.unwrap();

        let counts = store
            .counts_by_status(&SourceId::new("src"), &DestinationId::new("dst"))
            .await
            .unwrap();
        assert_eq!(counts.get("aborted"), Some(&1));
        assert_eq!(counts.get("waiting"), Some(&1));
    }

    #[tokio::test]
    async fn table_upload_upsert_preserves_terminal_rows() {
        let store = InMemoryTableUploadStore::new();
        let id = UploadId::new(1);
        store
            .create_many(&[TableUpload::new(id, "tracks", 14)])
            .await
            .unwrap();
        store
            .mark_exported(id, "tracks", 14, 0, Utc::now())
            .await
            .unwrap();

        // Re-running the counts phase must not reset the exported row.
        store
            .create_many(&[TableUpload::new(id, "tracks", 14)])
            .await
            .unwrap();
        let rows = store.for_upload(id).await.unwrap();
        assert_eq!(rows[0].status, TableUploadStatus::ExportedData);
        assert_eq!(rows[0].rows_inserted, 14);
    }

    #[tokio::test]
    async fn staging_pending_claims_in_id_order() {
        let store = InMemoryStagingFileStore::new();
        for n in 1..=5 {
            store.insert(staging_draft(n)).await.unwrap();
        }

        let pending = store
            .pending(
                &SourceId::new("src"),
                &DestinationId::new("dst"),
                StagingFileId::new(2),
                2,
            )
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, StagingFileId::new(3));
        assert_eq!(pending[1].id, StagingFileId::new(4));

        let range = store
            .in_range(
                &SourceId::new("src"),
                &DestinationId::new("dst"),
                StagingFileId::new(2),
                StagingFileId::new(4),
            )
            .await
            .unwrap();
        assert_eq!(range.len(), 3);
    }
}
