//! Router and manager end-to-end: config applied, staging drained into
//! the warehouse by the background loops, cooperative shutdown.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::json;

use wharf_core::id::{DestinationId, SourceId, WorkspaceId};
use wharf_core::schema::{DataType, Schema, TableSchema};
use wharf_core::storage::{MemoryObjectStore, ObjectStore, WritePrecondition};
use wharf_core::warehouse::{
    Destination, DestinationConfig, DestinationType, Source, Warehouse,
};
use wharf_warehouse::loadfile::write_staging_file;
use wharf_warehouse::StaticDriverRegistry;

use wharf_flow::admission::{AdmissionController, AdmissionLimits};
use wharf_flow::manager::DestinationManager;
use wharf_flow::repo::memory::{
    InMemoryStagingFileStore, InMemoryTableUploadStore, InMemoryUploadStore,
};
use wharf_flow::repo::{StagingFileStore, UploadStore};
use wharf_flow::router::{RouterConfig, RouterDeps};
use wharf_flow::runner::RunnerConfig;
use wharf_flow::schedule::TriggerStore;
use wharf_flow::scheduler::SchedulerConfig;
use wharf_flow::staging::StagingFileDraft;

fn warehouse() -> Warehouse {
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

fn fast_config() -> RouterConfig {
    RouterConfig {
        scheduler: SchedulerConfig {
            tick_interval: Duration::from_millis(20),
            ..SchedulerConfig::default()
        },
        runner: RunnerConfig::default(),
        worker_tick: Duration::from_millis(20),
        liveness_threshold: Duration::from_secs(600),
        pending_limit: 10,
    }
}

#[tokio::test]
async fn router_drains_staging_into_the_warehouse() {
    let storage = Arc::new(MemoryObjectStore::new());
    let uploads = Arc::new(InMemoryUploadStore::new());
    let staging = Arc::new(InMemoryStagingFileStore::new());

    // One staged batch of two events.
    let body = write_staging_file(&[
        json!({"table": "tracks", "data": {"id": "r1", "received_at": "2024-03-07T10:00:00Z"}}),
        json!({"table": "tracks", "data": {"id": "r2", "received_at": "2024-03-07T10:01:00Z"}}),
    ])
    .unwrap();
    storage
        .put("staging/batch-1.json.gz", Bytes::from(body), WritePrecondition::None)
        .await
        .unwrap();
    staging
        .insert(StagingFileDraft {
            source_id: SourceId::new("src-1"),
            destination_id: DestinationId::new("dst-1"),
            location: "staging/batch-1.json.gz".into(),
            schema: Schema::new().with_table(
                "tracks",
                TableSchema::new()
                    .with_column("id", DataType::String)
                    .with_column("received_at", DataType::Datetime),
            ),
            total_events: 2,
            size_bytes: 256,
            first_event_at: None,
            last_event_at: None,
        })
        .await
        .unwrap();

    let deps = RouterDeps {
        uploads: Arc::clone(&uploads) as Arc<dyn UploadStore>,
        table_uploads: Arc::new(InMemoryTableUploadStore::new()),
        staging: Arc::clone(&staging) as Arc<dyn StagingFileStore>,
        storage: Arc::clone(&storage) as Arc<dyn ObjectStore>,
        registry: Arc::new(StaticDriverRegistry::new(
            Arc::clone(&storage) as Arc<dyn ObjectStore>
        )),
        admission: Arc::new(AdmissionController::new(AdmissionLimits::default())),
        triggers: Arc::new(TriggerStore::new()),
    };
    let manager = DestinationManager::new(deps, fast_config());
    manager.apply_config(vec![warehouse()]).await;
    assert!(manager.is_ready());

    // The background loops create the upload and drive it to export.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let counts = uploads
            .counts_by_status(&SourceId::new("src-1"), &DestinationId::new("dst-1"))
            .await
            .unwrap();
        if counts.get("exported_data").copied().unwrap_or(0) == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "upload did not export in time: {counts:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Loaded objects landed under the destination namespace.
    let loaded = storage.list("analytics/tracks/").await.unwrap();
    assert_eq!(loaded.len(), 1);

    manager.shutdown().await;
}
