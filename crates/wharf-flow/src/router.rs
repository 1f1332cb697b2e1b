//! The per-(source, destination) router.
//!
//! A router owns two long-lived loops:
//!
//! - the **scheduler loop** creates upload rows when the warehouse is due
//! - the **worker loop** claims pending and interrupted uploads through
//!   the shared admission controller and drives them with the runner
//!
//! Shutdown is cooperative: the watch channel flips, the scheduler loop
//! exits at its next tick, and the runner releases ownership at the next
//! phase boundary. An upload left in a non-terminal state is recovered by
//! a later worker via the interrupted scan.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use wharf_core::storage::ObjectStore;
use wharf_core::warehouse::Warehouse;
use wharf_warehouse::DriverRegistry;

use crate::admission::{AdmissionController, Candidate};
use crate::error::{Error, Result};
use crate::repo::{StagingFileStore, TableUploadStore, UploadStore};
use crate::runner::{RunnerConfig, UploadRunner};
use crate::schedule::TriggerStore;
use crate::scheduler::{SchedulerConfig, UploadScheduler};
use crate::upload::Upload;

/// Router configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// Scheduler settings.
    pub scheduler: SchedulerConfig,
    /// Runner settings.
    pub runner: RunnerConfig,
    /// Interval between worker scans for claimable uploads.
    #[serde(with = "humantime_serde", default = "default_worker_tick")]
    pub worker_tick: Duration,
    /// Age of an in-progress upload's `updated_at` after which its owner
    /// is presumed dead.
    #[serde(with = "humantime_serde", default = "default_liveness_threshold")]
    pub liveness_threshold: Duration,
    /// Pending uploads fetched per worker scan.
    #[serde(default = "default_pending_limit")]
    pub pending_limit: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
            worker_tick: default_worker_tick(),
            liveness_threshold: default_liveness_threshold(),
            pending_limit: default_pending_limit(),
        }
    }
}

const fn default_worker_tick() -> Duration {
    Duration::from_secs(5)
}

const fn default_liveness_threshold() -> Duration {
    Duration::from_secs(10 * 60)
}

const fn default_pending_limit() -> usize {
    10
}

/// Shared dependencies every router is built from.
#[derive(Clone)]
pub struct RouterDeps {
    /// Upload repository.
    pub uploads: Arc<dyn UploadStore>,
    /// Table-upload repository.
    pub table_uploads: Arc<dyn TableUploadStore>,
    /// Staging-file repository.
    pub staging: Arc<dyn StagingFileStore>,
    /// Object storage.
    pub storage: Arc<dyn ObjectStore>,
    /// Warehouse driver registry.
    pub registry: Arc<dyn DriverRegistry>,
    /// Admission controller shared across every router.
    pub admission: Arc<AdmissionController>,
    /// Sync-now trigger store shared across every router.
    pub triggers: Arc<TriggerStore>,
}

/// A running router for one (source, destination) pair.
pub struct Router {
    identifier: String,
    revision_id: String,
    shutdown_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl Router {
    /// Spawns the scheduler and worker loops for the warehouse.
    #[must_use]
    pub fn spawn(warehouse: Warehouse, deps: &RouterDeps, config: &RouterConfig) -> Self {
        let identifier = warehouse.identifier();
        let revision_id = warehouse.destination.revision_id.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());

        let scheduler = UploadScheduler::new(
            warehouse.clone(),
            Arc::clone(&deps.uploads),
            Arc::clone(&deps.staging),
            Arc::clone(&deps.storage),
            Arc::clone(&deps.triggers),
            config.scheduler.clone(),
        );
        let scheduler_task = {
            let mut shutdown = shutdown_rx.clone();
            let wake = Arc::clone(&wake);
            let tick_interval = config.scheduler.tick_interval;
            let identifier = identifier.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(tick_interval) => {}
                        () = wake.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    if let Err(err) = scheduler.tick(Utc::now()).await {
                        warn!(warehouse = %identifier, error = %err, "scheduler tick failed");
                    }
                }
            })
        };

        let runner = UploadRunner::new(
            warehouse.clone(),
            Arc::clone(&deps.uploads),
            Arc::clone(&deps.table_uploads),
            Arc::clone(&deps.staging),
            Arc::clone(&deps.storage),
            Arc::clone(&deps.registry),
            config.runner.clone(),
            shutdown_rx.clone(),
        );
        let worker_task = {
            let mut shutdown = shutdown_rx;
            let uploads = Arc::clone(&deps.uploads);
            let admission = Arc::clone(&deps.admission);
            let worker_tick = config.worker_tick;
            let liveness_threshold = config.liveness_threshold;
            let pending_limit = config.pending_limit;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(worker_tick) => {}
                        _ = shutdown.changed() => {}
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    let result = claim_and_run(
                        &warehouse,
                        &uploads,
                        &admission,
                        &runner,
                        liveness_threshold,
                        pending_limit,
                    )
                    .await;
                    if let Err(err) = result {
                        warn!(
                            warehouse = %warehouse.identifier(),
                            error = %err,
                            "worker scan failed"
                        );
                    }
                }
            })
        };

        Self {
            identifier,
            revision_id,
            shutdown_tx,
            wake,
            tasks: vec![scheduler_task, worker_task],
        }
    }

    /// Returns the warehouse identifier this router serves.
    #[must_use]
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Returns the destination config revision the router was built from.
    /// The manager restarts routers whose revision changed.
    #[must_use]
    pub fn revision_id(&self) -> &str {
        &self.revision_id
    }

    /// Wakes the scheduler loop immediately (sync-now).
    pub fn trigger(&self) {
        self.wake.notify_one();
    }

    /// Stops both loops and waits for them to exit.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// One worker scan: gather this pair's claimable uploads, ask the shared
/// admission controller for a slot, and drive the admitted upload.
async fn claim_and_run(
    warehouse: &Warehouse,
    uploads: &Arc<dyn UploadStore>,
    admission: &Arc<AdmissionController>,
    runner: &UploadRunner,
    liveness_threshold: Duration,
    pending_limit: usize,
) -> Result<()> {
    let now = Utc::now();
    let destination_type = warehouse.destination.destination_type;

    let mut claimable: Vec<Upload> = uploads
        .interrupted(destination_type, now, liveness_threshold)
        .await?;
    claimable.extend(uploads.pending(destination_type, now, pending_limit).await?);
    claimable.retain(|u| {
        u.source_id == warehouse.source.id && u.destination_id == warehouse.destination.id
    });
    claimable.sort_by_key(|u| u.id);
    claimable.dedup_by_key(|u| u.id);

    if claimable.is_empty() {
        return Ok(());
    }

    let candidates: Vec<Candidate> = claimable.iter().map(Candidate::from).collect();
    let Some((upload_id, slot)) = admission.try_admit(&candidates) else {
        return Ok(());
    };

    let outcome = runner.run(upload_id).await;
    drop(slot);

    match outcome {
        Ok(outcome) => {
            debug!(
                warehouse = %warehouse.identifier(),
                upload_id = %upload_id,
                ?outcome,
                "upload run finished"
            );
            Ok(())
        }
        // Another worker won the ownership CAS; nothing to do.
        Err(Error::StaleUpload { .. }) => Ok(()),
        Err(err) => Err(err),
    }
}
