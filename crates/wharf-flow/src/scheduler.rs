//! Per-router upload creation.
//!
//! One scheduler runs per (source, destination) pair. Each tick it decides
//! whether the warehouse is due ([`crate::schedule::can_create_upload`]),
//! takes the pair's advisory lock to exclude schedulers in other
//! processes, claims a bounded batch of unprocessed staging files, unions
//! their schema snapshots and creates the upload row at `waiting`.
//!
//! Batch sizing honours a per-upload file cap and byte cap; staging files
//! are claimed in id order, which preserves event-time order across
//! batches.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wharf_core::id::StagingFileId;
use wharf_core::lock::AdvisoryLock;
use wharf_core::paths;
use wharf_core::schema::Schema;
use wharf_core::storage::ObjectStore;
use wharf_core::warehouse::Warehouse;

use crate::error::{Error, Result};
use crate::metrics;
use crate::repo::{StagingFileStore, UploadDraft, UploadStore};
use crate::schedule::{can_create_upload, ScheduleConfig, TriggerStore};
use crate::staging::StagingFile;
use crate::upload::Upload;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Interval between scheduler ticks.
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Maximum staging files claimed into one upload.
    pub max_staging_files_per_upload: usize,
    /// Maximum summed staging-file bytes per upload (at least one file is
    /// always claimed).
    pub max_upload_bytes: u64,
    /// TTL of the advisory lock held around upload creation.
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
    /// Schedule-calculation settings.
    pub schedule: ScheduleConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(10),
            max_staging_files_per_upload: 960,
            max_upload_bytes: 1 << 30,
            lock_ttl: Duration::from_secs(30),
            schedule: ScheduleConfig::default(),
        }
    }
}

/// The upload scheduler for one (source, destination) pair.
pub struct UploadScheduler<S: ObjectStore + ?Sized> {
    warehouse: Warehouse,
    uploads: Arc<dyn UploadStore>,
    staging: Arc<dyn StagingFileStore>,
    lock: AdvisoryLock<S>,
    triggers: Arc<TriggerStore>,
    config: SchedulerConfig,
}

impl<S: ObjectStore + ?Sized> UploadScheduler<S> {
    /// Creates a scheduler; the advisory lock key is derived from the
    /// pair.
    #[must_use]
    pub fn new(
        warehouse: Warehouse,
        uploads: Arc<dyn UploadStore>,
        staging: Arc<dyn StagingFileStore>,
        storage: Arc<S>,
        triggers: Arc<TriggerStore>,
        config: SchedulerConfig,
    ) -> Self {
        let lock_key = paths::lock_key(&warehouse.source.id, &warehouse.destination.id);
        Self {
            warehouse,
            uploads,
            staging,
            lock: AdvisoryLock::new(storage, lock_key),
            triggers,
            config,
        }
    }

    /// Runs one tick: gate, lock, claim, create.
    ///
    /// Returns the created upload, or `None` when the warehouse is not due,
    /// another scheduler holds the lock, or no staging files are pending.
    ///
    /// # Errors
    ///
    /// Returns an error on repository or lock failures.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Option<Upload>> {
        let identifier = self.warehouse.identifier();
        let last_created_at = self
            .uploads
            .last_created_at(&self.warehouse.source.id, &self.warehouse.destination.id)
            .await?;

        if let Err(reason) = can_create_upload(
            &self.warehouse,
            last_created_at,
            now,
            &self.config.schedule,
            &self.triggers,
        ) {
            debug!(warehouse = %identifier, %reason, "not creating an upload");
            metrics::record_scheduler_tick("skipped");
            return Ok(None);
        }

        let Some(guard) = self.lock.try_acquire(self.config.lock_ttl).await? else {
            debug!(warehouse = %identifier, "another scheduler holds the pair lock");
            metrics::record_scheduler_tick("locked");
            return Ok(None);
        };

        let created = self.create_upload().await;
        guard.release().await?;
        let created = created?;

        match &created {
            Some(upload) => {
                self.triggers.clear(&identifier);
                metrics::record_scheduler_tick("created");
                info!(
                    warehouse = %identifier,
                    upload_id = %upload.id,
                    staging_range = %format!(
                        "{}..={}",
                        upload.start_staging_file_id, upload.end_staging_file_id
                    ),
                    "created upload"
                );
            }
            None => metrics::record_scheduler_tick("empty"),
        }
        Ok(created)
    }

    async fn create_upload(&self) -> Result<Option<Upload>> {
        let source_id = &self.warehouse.source.id;
        let destination_id = &self.warehouse.destination.id;

        let after = self
            .uploads
            .last_staging_file_id(source_id, destination_id)
            .await?
            .unwrap_or(StagingFileId::new(0));

        let files = self
            .staging
            .pending(
                source_id,
                destination_id,
                after,
                self.config.max_staging_files_per_upload,
            )
            .await?;
        if files.is_empty() {
            return Ok(None);
        }

        let claimed = cap_by_bytes(files, self.config.max_upload_bytes);
        let schema = union_schemas(&claimed);

        let draft = UploadDraft {
            source_id: source_id.clone(),
            destination_id: destination_id.clone(),
            destination_type: self.warehouse.destination.destination_type,
            namespace: self.warehouse.namespace.clone(),
            workspace_id: self.warehouse.workspace_id.clone(),
            schema,
            start_staging_file_id: claimed[0].id,
            end_staging_file_id: claimed[claimed.len() - 1].id,
            first_event_at: claimed.iter().filter_map(|f| f.first_event_at).min(),
            last_event_at: claimed.iter().filter_map(|f| f.last_event_at).max(),
            priority: 0,
        };

        match self.uploads.create(draft).await {
            Ok(upload) => Ok(Some(upload)),
            // Lost a race with interrupted-upload recovery; the next
            // window picks the range up.
            Err(Error::ActiveUploadExists { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Truncates the batch at the byte cap, always keeping at least one file.
fn cap_by_bytes(files: Vec<StagingFile>, max_bytes: u64) -> Vec<StagingFile> {
    let mut claimed = Vec::with_capacity(files.len());
    let mut total: u64 = 0;
    for file in files {
        let size = u64::try_from(file.size_bytes).unwrap_or(0);
        if !claimed.is_empty() && total.saturating_add(size) > max_bytes {
            break;
        }
        total = total.saturating_add(size);
        claimed.push(file);
    }
    claimed
}

/// Unions the staging files' schema snapshots, column-wise.
///
/// Snapshots rarely disagree on a column type; when they do, the latest
/// staging file wins, since it reflects the newest upstream tracking plan.
fn union_schemas(files: &[StagingFile]) -> Schema {
    let mut schema = Schema::new();
    for file in files {
        for (table, table_schema) in file.schema.iter() {
            let mut merged = schema.table(table).cloned().unwrap_or_default();
            for (column, incoming) in table_schema.iter() {
                if let Some(existing) = merged.get(column) {
                    if existing != incoming {
                        warn!(
                            staging_file = %file.id,
                            table,
                            column,
                            %existing,
                            %incoming,
                            "staging schema snapshots disagree; latest wins"
                        );
                    }
                }
                merged.insert(column, incoming);
            }
            schema.insert(table, merged);
        }
    }
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_core::id::{DestinationId, SourceId, WorkspaceId};
    use wharf_core::schema::{DataType, TableSchema};
    use wharf_core::storage::MemoryObjectStore;
    use wharf_core::warehouse::{Destination, DestinationConfig, DestinationType, Source};

    use crate::repo::memory::{InMemoryStagingFileStore, InMemoryUploadStore};
    use crate::staging::StagingFileDraft;
    use crate::upload::UploadStatus;

    fn warehouse() -> Warehouse {
        Warehouse {
            source: Source {
                id: SourceId::new("src"),
                name: "app".into(),
                enabled: true,
            },
            destination: Destination {
                id: DestinationId::new("dst"),
                name: "pg".into(),
                destination_type: DestinationType::Postgres,
                enabled: true,
                revision_id: "rev".into(),
                // No schedule configured: gate on the default interval.
                config: DestinationConfig::new(),
            },
            workspace_id: WorkspaceId::new("ws"),
            namespace: "analytics".into(),
        }
    }

    fn tracks_schema() -> Schema {
        Schema::new().with_table(
            "tracks",
            TableSchema::new()
                .with_column("id", DataType::String)
                .with_column("received_at", DataType::Datetime),
        )
    }

    struct Fixture {
        scheduler: UploadScheduler<MemoryObjectStore>,
        uploads: Arc<InMemoryUploadStore>,
        staging: Arc<InMemoryStagingFileStore>,
    }

    fn fixture() -> Fixture {
        let uploads = Arc::new(InMemoryUploadStore::new());
        let staging = Arc::new(InMemoryStagingFileStore::new());
        let scheduler = UploadScheduler::new(
            warehouse(),
            Arc::clone(&uploads) as Arc<dyn UploadStore>,
            Arc::clone(&staging) as Arc<dyn StagingFileStore>,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(TriggerStore::new()),
            SchedulerConfig::default(),
        );
        Fixture {
            scheduler,
            uploads,
            staging,
        }
    }

    async fn seed_staging(staging: &InMemoryStagingFileStore, count: usize, size_bytes: i64) {
        for n in 0..count {
            staging
                .insert(StagingFileDraft {
                    source_id: SourceId::new("src"),
                    destination_id: DestinationId::new("dst"),
                    location: format!("staging/{n}"),
                    schema: tracks_schema(),
                    total_events: 10,
                    size_bytes,
                    first_event_at: None,
                    last_event_at: None,
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn tick_claims_pending_files_into_a_waiting_upload() {
        let f = fixture();
        seed_staging(&f.staging, 3, 100).await;

        let upload = f.scheduler.tick(Utc::now()).await.unwrap().unwrap();
        assert_eq!(upload.status, UploadStatus::Waiting);
        assert_eq!(upload.start_staging_file_id, StagingFileId::new(1));
        assert_eq!(upload.end_staging_file_id, StagingFileId::new(3));
        assert_eq!(upload.schema.tables(), vec!["tracks"]);
    }

    #[tokio::test]
    async fn tick_without_staging_files_creates_nothing() {
        let f = fixture();
        assert!(f.scheduler.tick(Utc::now()).await.unwrap().is_none());
        assert_eq!(f.uploads.upload_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn consecutive_uploads_claim_disjoint_ranges() {
        let f = fixture();
        seed_staging(&f.staging, 2, 100).await;

        let now = Utc::now();
        let first = f.scheduler.tick(now).await.unwrap().unwrap();
        assert_eq!(first.end_staging_file_id, StagingFileId::new(2));

        // Walk the first upload to its terminal checkpoint.
        let mut status = UploadStatus::Waiting;
        while let Some(next) = status.next() {
            f.uploads.transition(first.id, status, next).await.unwrap();
            status = next;
        }

        seed_staging(&f.staging, 2, 100).await;
        let later = now + chrono::Duration::hours(1);
        let second = f.scheduler.tick(later).await.unwrap().unwrap();

        // The second upload starts strictly after the first one's range.
        assert_eq!(second.start_staging_file_id, StagingFileId::new(3));
        assert_eq!(second.end_staging_file_id, StagingFileId::new(4));
    }

    #[tokio::test]
    async fn byte_cap_bounds_the_claimed_range() {
        let f = fixture();
        seed_staging(&f.staging, 5, 600).await;

        let mut config = SchedulerConfig::default();
        config.max_upload_bytes = 1000;
        let scheduler = UploadScheduler::new(
            warehouse(),
            Arc::clone(&f.uploads) as Arc<dyn UploadStore>,
            Arc::clone(&f.staging) as Arc<dyn StagingFileStore>,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(TriggerStore::new()),
            config,
        );

        let upload = scheduler.tick(Utc::now()).await.unwrap().unwrap();
        // 600 + 600 > 1000: only the first file fits.
        assert_eq!(upload.start_staging_file_id, StagingFileId::new(1));
        assert_eq!(upload.end_staging_file_id, StagingFileId::new(1));
    }

    #[tokio::test]
    async fn schedule_gate_blocks_second_upload_in_interval() {
        let f = fixture();
        seed_staging(&f.staging, 1, 100).await;

        let now = Utc::now();
        assert!(f.scheduler.tick(now).await.unwrap().is_some());

        seed_staging(&f.staging, 1, 100).await;
        // Terminal-ize the first upload so only the schedule gates.
        let pending = f
            .uploads
            .pending(DestinationType::Postgres, now, 10)
            .await
            .unwrap();
        f.uploads
            .transition(pending[0].id, UploadStatus::Waiting, UploadStatus::Aborted)
            .await
            .unwrap();

        // Within the default interval: not due.
        assert!(f
            .scheduler
            .tick(now + chrono::Duration::minutes(1))
            .await
            .unwrap()
            .is_none());
        // Past it: due.
        assert!(f
            .scheduler
            .tick(now + chrono::Duration::minutes(31))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn active_upload_blocks_creation_without_error() {
        let f = fixture();
        seed_staging(&f.staging, 1, 100).await;

        let now = Utc::now();
        assert!(f.scheduler.tick(now).await.unwrap().is_some());

        seed_staging(&f.staging, 1, 100).await;
        // The first upload is still waiting (non-terminal): creation is
        // skipped, not failed.
        let later = now + chrono::Duration::hours(1);
        assert!(f.scheduler.tick(later).await.unwrap().is_none());
    }

    #[test]
    fn union_prefers_latest_snapshot_on_conflict() {
        let old = StagingFile {
            id: StagingFileId::new(1),
            source_id: SourceId::new("src"),
            destination_id: DestinationId::new("dst"),
            location: "staging/1".into(),
            schema: Schema::new().with_table(
                "tracks",
                TableSchema::new().with_column("revenue", DataType::Int),
            ),
            total_events: 1,
            size_bytes: 10,
            first_event_at: None,
            last_event_at: None,
            created_at: Utc::now(),
        };
        let mut new = old.clone();
        new.id = StagingFileId::new(2);
        new.schema = Schema::new().with_table(
            "tracks",
            TableSchema::new().with_column("revenue", DataType::Float),
        );

        let schema = union_schemas(&[old, new]);
        assert_eq!(
            schema.table("tracks").unwrap().get("revenue"),
            Some(DataType::Float)
        );
    }
}
