//! # wharf-flow
//!
//! The upload control plane of the Wharf warehouse ingestion platform.
//!
//! This crate decides *when* each warehouse destination runs an ingestion
//! cycle and drives that cycle through a durable state machine:
//!
//! - **Schedule Calculator**: pure functions from (syncFrequency,
//!   syncStartAt, now) to the previous scheduled instant and exclude
//!   windows
//! - **Repositories**: CAS-transitioned stores for uploads, table uploads
//!   and staging files (in-memory for tests, Postgres for production)
//! - **State Machine**: `waiting → generating_load_files → … →
//!   exported_data` with resumable checkpoints and taxonomy-driven
//!   retry/abort
//! - **Admission Controller**: global / per-destination-type /
//!   per-destination limits with a strict round-robin cursor
//! - **Routers & Manager**: one long-lived router per (source,
//!   destination) pair, reconciled against control-plane config
//!
//! ## Guarantees
//!
//! - At most one non-terminal upload per (source, destination) pair
//! - Status advances only forward; ownership is acquired by
//!   compare-and-set
//! - At-least-once delivery: every phase is idempotent and a dead
//!   worker's upload is recovered via the interrupted scan

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod admission;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod repo;
pub mod router;
pub mod runner;
pub mod schedule;
pub mod scheduler;
pub mod staging;
pub mod upload;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::admission::{AdmissionController, AdmissionLimits, Candidate};
    pub use crate::error::{Error, Result};
    pub use crate::manager::DestinationManager;
    pub use crate::repo::{
        CasResult, StagingFileStore, TableUploadStore, UploadDraft, UploadStore,
    };
    pub use crate::router::{Router, RouterConfig, RouterDeps};
    pub use crate::runner::{RunOutcome, RunnerConfig, UploadRunner};
    pub use crate::schedule::{
        can_create_upload, ScheduleConfig, SkipReason, TriggerStore,
    };
    pub use crate::scheduler::{SchedulerConfig, UploadScheduler};
    pub use crate::staging::{StagingFile, StagingFileDraft};
    pub use crate::upload::{
        TableUpload, TableUploadStatus, Upload, UploadStatus,
    };
}
