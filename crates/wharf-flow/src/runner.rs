//! The upload state-machine driver.
//!
//! One runner drives one upload one phase at a time. Ownership of a phase
//! is acquired by a compare-and-set status transition in the upload store;
//! a worker that loses the CAS backs off, a worker that dies mid-phase is
//! replaced via the interrupted-uploads scan and the new owner re-runs the
//! phase (every phase is idempotent).
//!
//! ## Failure policy
//!
//! A phase error is appended to the upload's error history under the
//! phase's status label, preserving the original message across retries.
//! Retryable errors park the upload in `failed` with exponential backoff
//! `min(base * 2^n, cap)`; attempts beyond the configured maximum, and
//! non-retryable errors (permissions, fatal config), abort the upload.
//!
//! ## Table ordering
//!
//! Within one upload, identity and user tables load strictly before
//! dependent fact tables; the rest load concurrently up to the per-upload
//! parallelism cap.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use wharf_core::paths;
use wharf_core::schema::{Schema, TableSchema};
use wharf_core::storage::ObjectStore;
use wharf_core::warehouse::Warehouse;

use wharf_warehouse::discards::{discards_schema, DISCARDS_TABLE};
use wharf_warehouse::driver::{
    DriverError, ErrorKind, LoadTableStats, Uploader, WarehouseDriver, IDENTIFIES_TABLE,
    IDENTITY_MERGE_RULES_TABLE, USERS_TABLE,
};
use wharf_warehouse::loadfile::{GeneratedLoadFiles, LoadFileGenerator};
use wharf_warehouse::values::StringPolicy;
use wharf_warehouse::{DriverRegistry, LoadFile};

use crate::error::{Error, Result};
use crate::metrics;
use crate::repo::{CasResult, StagingFileStore, TableUploadStore, UploadStore};
use crate::upload::{TableUpload, TableUploadStatus, Upload, UploadStatus};

/// Tables loaded strictly before the rest, in this order.
const PRIORITY_TABLES: [&str; 3] = [IDENTITY_MERGE_RULES_TABLE, IDENTIFIES_TABLE, USERS_TABLE];

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Maximum attempts per upload before aborting.
    pub max_attempts: u32,
    /// Base of the exponential retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    /// Cap of the exponential retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_cap: Duration,
    /// Concurrent table loads within one upload.
    pub max_parallel_loads: usize,
    /// Deadline for one driver operation; exceeding it counts as a
    /// transient failure of the phase.
    #[serde(with = "humantime_serde")]
    pub driver_timeout: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(60),
            backoff_cap: Duration::from_secs(30 * 60),
            max_parallel_loads: 4,
            driver_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Outcome of one run over an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every table loaded; the upload reached `exported_data`.
    Exported,
    /// A retryable phase failure; the upload is parked until the timer.
    FailedWillRetry {
        /// Earliest instant of the next attempt.
        next_retry_at: DateTime<Utc>,
    },
    /// Attempts exhausted or a non-retryable error.
    Aborted,
    /// Shutdown requested; ownership released at the phase boundary.
    Interrupted,
}

/// The uploader collaborator handed to drivers, scoped to one upload.
struct UploadContext {
    use_rudder_storage: bool,
    upload_schema: Schema,
    warehouse_schema: Mutex<Schema>,
    load_files: Mutex<HashMap<String, Vec<LoadFile>>>,
}

impl UploadContext {
    fn new(upload_schema: Schema, use_rudder_storage: bool) -> Self {
        Self {
            use_rudder_storage,
            upload_schema,
            warehouse_schema: Mutex::new(Schema::new()),
            load_files: Mutex::new(HashMap::new()),
        }
    }

    fn set_warehouse_schema(&self, schema: Schema) {
        if let Ok(mut guard) = self.warehouse_schema.lock() {
            *guard = schema;
        }
    }

    fn warehouse_schema_is_empty(&self) -> bool {
        self.warehouse_schema
            .lock()
            .map_or(true, |schema| schema.is_empty())
    }

    fn set_load_files(&self, files: HashMap<String, Vec<LoadFile>>) {
        if let Ok(mut guard) = self.load_files.lock() {
            *guard = files;
        }
    }

    fn has_load_files(&self) -> bool {
        self.load_files.lock().is_ok_and(|files| !files.is_empty())
    }
}

#[async_trait::async_trait]
impl Uploader for UploadContext {
    fn use_rudder_storage(&self) -> bool {
        self.use_rudder_storage
    }

    async fn load_files(&self, table: &str) -> wharf_warehouse::driver::Result<Vec<LoadFile>> {
        Ok(self
            .load_files
            .lock()
            .ok()
            .and_then(|files| files.get(table).cloned())
            .unwrap_or_default())
    }

    fn schema_in_upload(&self, table: &str) -> TableSchema {
        if table == DISCARDS_TABLE {
            return discards_schema();
        }
        self.upload_schema.table(table).cloned().unwrap_or_default()
    }

    fn schema_in_warehouse(&self, table: &str) -> TableSchema {
        self.warehouse_schema
            .lock()
            .ok()
            .and_then(|schema| schema.table(table).cloned())
            .unwrap_or_default()
    }
}

/// Per-run scratch state: the driver and generation results live for one
/// run only; durable progress lives in the stores.
struct RunState {
    context: Arc<UploadContext>,
    driver: Option<Box<dyn WarehouseDriver>>,
    generated: Option<GeneratedLoadFiles>,
}

/// Drives uploads of one warehouse through the state machine.
pub struct UploadRunner {
    warehouse: Warehouse,
    uploads: Arc<dyn UploadStore>,
    table_uploads: Arc<dyn TableUploadStore>,
    staging: Arc<dyn StagingFileStore>,
    storage: Arc<dyn ObjectStore>,
    registry: Arc<dyn DriverRegistry>,
    config: RunnerConfig,
    shutdown: watch::Receiver<bool>,
}

impl UploadRunner {
    /// Creates a runner for the warehouse.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        warehouse: Warehouse,
        uploads: Arc<dyn UploadStore>,
        table_uploads: Arc<dyn TableUploadStore>,
        staging: Arc<dyn StagingFileStore>,
        storage: Arc<dyn ObjectStore>,
        registry: Arc<dyn DriverRegistry>,
        config: RunnerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            warehouse,
            uploads,
            table_uploads,
            staging,
            storage,
            registry,
            config,
            shutdown,
        }
    }

    /// Drives the upload from its current status to a terminal status, a
    /// retry park, or an interruption at a phase boundary.
    ///
    /// # Errors
    ///
    /// Returns an error when the upload vanishes, another worker wins the
    /// ownership CAS, or the stores fail.
    #[tracing::instrument(
        skip_all,
        fields(warehouse = %self.warehouse.identifier(), upload_id = %upload_id)
    )]
    pub async fn run(&self, upload_id: wharf_core::id::UploadId) -> Result<RunOutcome> {
        let mut upload = self
            .uploads
            .get(upload_id)
            .await?
            .ok_or(Error::UploadNotFound { id: upload_id })?;

        let mut state = RunState {
            context: Arc::new(UploadContext::new(
                upload.schema.clone(),
                self.warehouse.destination.config.use_rudder_storage(),
            )),
            driver: None,
            generated: None,
        };

        loop {
            if *self.shutdown.borrow() {
                info!(upload_id = %upload.id, "shutdown requested, releasing at phase boundary");
                return Ok(RunOutcome::Interrupted);
            }

            let Some(phase) = upload.resume_point() else {
                return Ok(match upload.status {
                    UploadStatus::ExportedData => RunOutcome::Exported,
                    _ => RunOutcome::Aborted,
                });
            };

            // Claim the phase.
            if upload.status != phase {
                match self.uploads.transition(upload.id, upload.status, phase).await? {
                    CasResult::Applied => {}
                    CasResult::NotFound => {
                        return Err(Error::UploadNotFound { id: upload.id });
                    }
                    CasResult::StateMismatch { actual } => {
                        return Err(Error::StaleUpload {
                            id: upload.id,
                            expected: upload.status,
                            actual,
                        });
                    }
                }
            }
            upload = self.refetch(upload.id).await?;

            let started = Instant::now();
            let result = self.execute_phase(&upload, &mut state).await;
            metrics::observe_phase_duration(phase.as_label(), started.elapsed());

            match result {
                Ok(()) => {
                    let done = phase.completed().ok_or(Error::InvalidStateTransition {
                        from: phase,
                        to: phase,
                    })?;
                    match self.uploads.transition(upload.id, phase, done).await? {
                        CasResult::Applied => {}
                        CasResult::NotFound => {
                            return Err(Error::UploadNotFound { id: upload.id });
                        }
                        CasResult::StateMismatch { actual } => {
                            return Err(Error::StaleUpload {
                                id: upload.id,
                                expected: phase,
                                actual,
                            });
                        }
                    }
                    if done == UploadStatus::ExportedData {
                        metrics::record_upload_outcome("exported_data");
                        info!(upload_id = %upload.id, "upload exported");
                        return Ok(RunOutcome::Exported);
                    }
                    upload = self.refetch(upload.id).await?;
                }
                Err(err) => return self.handle_phase_error(&upload, phase, &err).await,
            }
        }
    }

    async fn refetch(&self, id: wharf_core::id::UploadId) -> Result<Upload> {
        self.uploads
            .get(id)
            .await?
            .ok_or(Error::UploadNotFound { id })
    }

    async fn handle_phase_error(
        &self,
        upload: &Upload,
        phase: UploadStatus,
        err: &Error,
    ) -> Result<RunOutcome> {
        let message = err.to_string();
        warn!(upload_id = %upload.id, phase = %phase, error = %message, "upload phase failed");
        self.uploads.append_error(upload.id, phase, &message).await?;

        let attempts = upload.metadata.retry_count + 1;
        if !err.is_retryable() || attempts >= self.config.max_attempts {
            self.uploads
                .transition(upload.id, phase, UploadStatus::Aborted)
                .await?;
            metrics::record_upload_outcome("aborted");
            return Ok(RunOutcome::Aborted);
        }

        let next_retry_at = Utc::now() + self.backoff(attempts);
        self.uploads
            .update_retry(upload.id, attempts, Some(next_retry_at))
            .await?;
        self.uploads
            .transition(upload.id, phase, UploadStatus::Failed)
            .await?;
        Ok(RunOutcome::FailedWillRetry { next_retry_at })
    }

    /// `min(base * 2^(attempt-1), cap)`.
    fn backoff(&self, attempt: u32) -> chrono::Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = self
            .config
            .backoff_base
            .checked_mul(1 << exponent)
            .unwrap_or(self.config.backoff_cap)
            .min(self.config.backoff_cap);
        chrono::Duration::from_std(scaled).unwrap_or_else(|_| chrono::Duration::minutes(30))
    }

    /// Wraps a driver call in the per-operation deadline.
    async fn deadline<T, F>(&self, operation: F) -> Result<T>
    where
        F: Future<Output = wharf_warehouse::driver::Result<T>>,
    {
        match tokio::time::timeout(self.config.driver_timeout, operation).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(DriverError::new(
                ErrorKind::Transient,
                "driver operation exceeded its deadline",
            )
            .into()),
        }
    }

    async fn execute_phase(&self, upload: &Upload, state: &mut RunState) -> Result<()> {
        match upload.status {
            UploadStatus::GeneratingLoadFiles => self.generate_load_files(upload, state).await,
            UploadStatus::UpdatingTableUploadsCounts => {
                self.update_table_upload_counts(upload, state).await
            }
            UploadStatus::CreatingRemoteSchema => self.create_remote_schema(upload, state).await,
            UploadStatus::ExportingData => self.export_data(upload, state).await,
            other => Err(Error::InvalidStateTransition {
                from: other,
                to: other,
            }),
        }
    }

    /// Produces per-table load files from the claimed staging range.
    ///
    /// Deterministic keys make re-runs overwrite rather than duplicate.
    async fn generate_load_files(&self, upload: &Upload, state: &mut RunState) -> Result<()> {
        let staging_files = self
            .staging
            .in_range(
                &upload.source_id,
                &upload.destination_id,
                upload.start_staging_file_id,
                upload.end_staging_file_id,
            )
            .await?;
        let locations: Vec<String> = staging_files.iter().map(|f| f.location.clone()).collect();

        let generator = LoadFileGenerator::new(Arc::clone(&self.storage))
            .with_policy(StringPolicy::for_destination(upload.destination_type));
        let generated = generator
            .generate(
                upload.id,
                &upload.source_id,
                &upload.schema,
                &locations,
                Utc::now(),
            )
            .await?;

        metrics::record_discards(u64::try_from(generated.discarded).unwrap_or(0));

        let mut load_files = HashMap::new();
        for table in &generated.tables {
            load_files.insert(table.table.clone(), table.files.clone());
        }
        state.context.set_load_files(load_files);
        state.generated = Some(generated);
        Ok(())
    }

    /// Creates table-upload rows and persists per-table counts and
    /// locations.
    async fn update_table_upload_counts(&self, upload: &Upload, state: &mut RunState) -> Result<()> {
        // A worker resuming here lost the previous owner's in-memory
        // generation results; regeneration is idempotent.
        if state.generated.is_none() {
            self.generate_load_files(upload, state).await?;
        }
        let Some(generated) = &state.generated else {
            return Err(Error::Core(wharf_core::Error::internal(
                "load-file generation produced no results",
            )));
        };

        let rows: Vec<TableUpload> = generated
            .tables
            .iter()
            .map(|t| TableUpload::new(upload.id, &t.table, t.total_events))
            .collect();
        self.table_uploads.create_many(&rows).await?;

        for table in &generated.tables {
            if let Some(file) = table.files.first() {
                self.table_uploads
                    .set_location(upload.id, &table.table, &file.location, table.total_events)
                    .await?;
            }
        }
        Ok(())
    }

    /// Fetches the remote schema and reconciles it additively: new tables
    /// and columns are created, conflicted tables abort while the rest of
    /// the upload proceeds.
    async fn create_remote_schema(&self, upload: &Upload, state: &mut RunState) -> Result<()> {
        let table_rows = self.table_uploads.for_upload(upload.id).await?;
        let context = Arc::clone(&state.context);
        let driver = self.ensure_driver(state)?;

        self.deadline(driver.create_schema()).await?;
        let remote = self.deadline(driver.fetch_schema()).await?;

        let diff = upload.schema.diff(&remote);
        let now = Utc::now();
        let conflicting = diff.conflicting_tables();
        for conflict in &diff.conflicts {
            let message = wharf_core::Error::SchemaConflict {
                table: conflict.table.clone(),
                column: conflict.column.clone(),
                existing: conflict.existing,
                incoming: conflict.incoming,
            }
            .to_string();
            self.table_uploads
                .transition(
                    upload.id,
                    &conflict.table,
                    TableUploadStatus::Aborted,
                    Some(&message),
                    now,
                )
                .await?;
            metrics::record_table_load("aborted");
        }

        let mut merged = remote;
        for (table, schema) in &diff.new_tables {
            if conflicting.contains(&table.as_str()) {
                continue;
            }
            self.deadline(driver.create_table(table, schema)).await?;
            merged.insert(table, schema.clone());
        }
        for (table, add_columns) in &diff.new_columns {
            if conflicting.contains(&table.as_str()) {
                continue;
            }
            self.deadline(driver.alter_table(table, add_columns)).await?;
            let mut table_schema = merged.table(table).cloned().unwrap_or_default();
            table_schema.merge_from(table, add_columns)?;
            merged.insert(table, table_schema);
        }

        // The discards table is not part of the event schema but loads
        // through the same path.
        let has_discards = table_rows.iter().any(|t| t.table_name == DISCARDS_TABLE);
        if has_discards && merged.table(DISCARDS_TABLE).is_none() {
            self.deadline(driver.create_table(DISCARDS_TABLE, &discards_schema()))
                .await?;
            merged.insert(DISCARDS_TABLE, discards_schema());
        }

        self.uploads.set_merged_schema(upload.id, &merged).await?;
        context.set_warehouse_schema(merged);
        Ok(())
    }

    /// Loads every non-terminal table through the driver: identity and
    /// user tables sequentially first, the rest concurrently.
    async fn export_data(&self, upload: &Upload, state: &mut RunState) -> Result<()> {
        self.ensure_load_files(upload, state).await?;

        let context = Arc::clone(&state.context);
        let driver = self.ensure_driver(state)?;

        if context.warehouse_schema_is_empty() {
            match &upload.merged_schema {
                Some(merged) => context.set_warehouse_schema(merged.clone()),
                None => {
                    let remote = self.deadline(driver.fetch_schema()).await?;
                    context.set_warehouse_schema(remote);
                }
            }
        }

        let rows = self.table_uploads.for_upload(upload.id).await?;
        let exhausted = upload.metadata.retry_count + 1 >= self.config.max_attempts;

        let mut priority: Vec<TableUpload> = Vec::new();
        let mut rest: Vec<TableUpload> = Vec::new();
        for row in rows {
            if row.status.is_terminal() {
                continue;
            }
            if PRIORITY_TABLES.contains(&row.table_name.as_str()) {
                priority.push(row);
            } else {
                rest.push(row);
            }
        }
        priority.sort_by_key(|t| {
            PRIORITY_TABLES
                .iter()
                .position(|p| *p == t.table_name)
                .unwrap_or(PRIORITY_TABLES.len())
        });

        // Identity and user tables first; a failure here blocks the
        // dependent tables outright.
        for table in &priority {
            self.load_one_table(upload, driver, table, exhausted).await?;
        }

        let mut blocking_error: Option<Error> = None;
        let mut in_flight = FuturesUnordered::new();
        let mut queue = rest.into_iter();
        loop {
            while in_flight.len() < self.config.max_parallel_loads.max(1) {
                let Some(table) = queue.next() else { break };
                in_flight
                    .push(async move { self.load_one_table(upload, driver, &table, exhausted).await });
            }
            let Some(result) = in_flight.next().await else {
                break;
            };
            if let Err(err) = result {
                // Two failures leave the table aborted without failing the
                // phase: a table-level schema conflict, and a transient
                // failure with no attempts left. Everything else blocks
                // the phase and drives the upload's retry/abort decision.
                let table_aborts_alone = match &err {
                    Error::Warehouse(driver_err)
                        if driver_err.kind() == ErrorKind::SchemaConflict =>
                    {
                        true
                    }
                    other => other.is_retryable() && exhausted,
                };
                if !table_aborts_alone && blocking_error.is_none() {
                    blocking_error = Some(err);
                }
            }
        }

        match blocking_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn load_one_table(
        &self,
        upload: &Upload,
        driver: &dyn WarehouseDriver,
        table: &TableUpload,
        exhausted: bool,
    ) -> Result<()> {
        let now = Utc::now();
        self.table_uploads
            .transition(
                upload.id,
                &table.table_name,
                TableUploadStatus::ExportingData,
                None,
                now,
            )
            .await?;

        let result = if table.table_name == IDENTITY_MERGE_RULES_TABLE {
            self.deadline(driver.load_identity_merge_rules_table()).await
        } else {
            self.deadline(driver.load_table(&table.table_name)).await
        };

        match result {
            Ok(LoadTableStats {
                rows_inserted,
                rows_updated,
            }) => {
                self.table_uploads
                    .mark_exported(
                        upload.id,
                        &table.table_name,
                        rows_inserted,
                        rows_updated,
                        Utc::now(),
                    )
                    .await?;
                metrics::record_table_load("exported");
                Ok(())
            }
            Err(err) => {
                let status = if exhausted || !err.is_retryable() {
                    metrics::record_table_load("aborted");
                    TableUploadStatus::Aborted
                } else {
                    metrics::record_table_load("failed");
                    TableUploadStatus::Failed
                };
                self.table_uploads
                    .transition(
                        upload.id,
                        &table.table_name,
                        status,
                        Some(&err.to_string()),
                        Utc::now(),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    fn ensure_driver<'a>(&self, state: &'a mut RunState) -> Result<&'a dyn WarehouseDriver> {
        if state.driver.is_none() {
            let uploader: Arc<dyn Uploader> = Arc::clone(&state.context) as Arc<dyn Uploader>;
            state.driver = Some(self.registry.driver_for(&self.warehouse, uploader)?);
        }
        match &state.driver {
            Some(driver) => Ok(driver.as_ref()),
            None => Err(Error::Core(wharf_core::Error::internal(
                "driver construction produced no driver",
            ))),
        }
    }

    /// Fills the context's load-file map: from this run's generation
    /// results when present, otherwise by listing the deterministic
    /// load-file keys (resume after a process death).
    async fn ensure_load_files(&self, upload: &Upload, state: &mut RunState) -> Result<()> {
        if state.context.has_load_files() {
            return Ok(());
        }
        if let Some(generated) = &state.generated {
            let mut load_files = HashMap::new();
            for table in &generated.tables {
                load_files.insert(table.table.clone(), table.files.clone());
            }
            state.context.set_load_files(load_files);
            return Ok(());
        }

        let rows = self.table_uploads.for_upload(upload.id).await?;
        let mut load_files = HashMap::new();
        for row in &rows {
            let prefix = paths::load_file_dir(&row.table_name, &upload.source_id, upload.id);
            let mut objects = self.storage.list(&prefix).await?;
            objects.sort_by(|a, b| a.key.cmp(&b.key));
            let files: Vec<LoadFile> = objects
                .into_iter()
                .map(|meta| LoadFile {
                    location: meta.key,
                    total_rows: None,
                })
                .collect();
            if !files.is_empty() {
                load_files.insert(row.table_name.clone(), files);
            }
        }
        state.context.set_load_files(load_files);
        Ok(())
    }
}
