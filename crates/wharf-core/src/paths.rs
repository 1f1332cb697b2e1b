//! Object-storage key layout.
//!
//! All keys Wharf reads or writes are built here so the layout stays a
//! single, contract-tested surface:
//!
//! ```text
//! rudder-warehouse-staging-logs/<sourceId>/<YYYY-MM-DD>/<batchId>.json.gz
//! rudder-warehouse-load-objects/<table>/<sourceId>/<uploadId>-<table>/load.csv.gz
//! warehouse-sync-locks/<sourceId>:<destinationId>.lock
//! ```
//!
//! Load-file keys are deterministic in (table, source, upload): re-running
//! the load-file generation phase overwrites the same keys, which is what
//! makes the phase idempotent.

use chrono::NaiveDate;

use crate::id::{BatchId, DestinationId, SourceId, UploadId};

/// Prefix under which the upstream producer writes staging files.
pub const STAGING_PREFIX: &str = "rudder-warehouse-staging-logs";

/// Prefix under which the load pipeline writes per-table load files.
pub const LOAD_PREFIX: &str = "rudder-warehouse-load-objects";

/// Prefix under which schedulers keep their advisory lock objects.
pub const LOCK_PREFIX: &str = "warehouse-sync-locks";

/// Key of one staged event batch.
#[must_use]
pub fn staging_file_key(source: &SourceId, day: NaiveDate, batch: &BatchId) -> String {
    format!(
        "{STAGING_PREFIX}/{source}/{}/{batch}.json.gz",
        day.format("%Y-%m-%d")
    )
}

/// Directory holding one upload's load files for one table (with the
/// trailing slash, ready for prefix listing).
#[must_use]
pub fn load_file_dir(table: &str, source: &SourceId, upload: UploadId) -> String {
    format!("{LOAD_PREFIX}/{table}/{source}/{upload}-{table}/")
}

/// Key of one per-table load file.
///
/// `part` 0 is the primary file; further parts (produced when the per-upload
/// byte cap splits a table) get a numeric infix.
#[must_use]
pub fn load_file_key(table: &str, source: &SourceId, upload: UploadId, part: usize) -> String {
    let dir = load_file_dir(table, source, upload);
    if part == 0 {
        format!("{dir}load.csv.gz")
    } else {
        format!("{dir}load.{part}.csv.gz")
    }
}

/// Key of the advisory lock object for one (source, destination) pair.
#[must_use]
pub fn lock_key(source: &SourceId, destination: &DestinationId) -> String {
    format!("{LOCK_PREFIX}/{source}:{destination}.lock")
}

/// Key of a datalake destination's schema manifest.
#[must_use]
pub fn datalake_schema_key(namespace: &str) -> String {
    format!("{namespace}/.wharf/schema.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    // The layouts below are wire contracts shared with the staging-file
    // producer and every driver; change them and deployed pipelines stop
    // finding their files.

    #[test]
    fn staging_file_key_layout() {
        let key = staging_file_key(
            &SourceId::new("src-1"),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
            &"01HQV4BB4N6WZM2YVPJ3N9T8RD".parse().unwrap(),
        );
        assert_eq!(
            key,
            "rudder-warehouse-staging-logs/src-1/2024-03-07/01HQV4BB4N6WZM2YVPJ3N9T8RD.json.gz"
        );
    }

    #[test]
    fn load_file_key_layout() {
        let key = load_file_key("tracks", &SourceId::new("src-1"), UploadId::new(42), 0);
        assert_eq!(
            key,
            "rudder-warehouse-load-objects/tracks/src-1/42-tracks/load.csv.gz"
        );
    }

    #[test]
    fn load_file_parts_get_numeric_infix() {
        let key = load_file_key("tracks", &SourceId::new("src-1"), UploadId::new(42), 2);
        assert!(key.ends_with("/load.2.csv.gz"));
    }

    #[test]
    fn load_file_key_is_deterministic() {
        let a = load_file_key("tracks", &SourceId::new("s"), UploadId::new(1), 0);
        let b = load_file_key("tracks", &SourceId::new("s"), UploadId::new(1), 0);
        assert_eq!(a, b);
    }

    #[test]
    fn lock_key_layout() {
        let key = lock_key(&SourceId::new("src-1"), &DestinationId::new("dst-1"));
        assert_eq!(key, "warehouse-sync-locks/src-1:dst-1.lock");
    }

    #[test]
    fn datalake_schema_key_lives_under_namespace() {
        assert_eq!(datalake_schema_key("analytics"), "analytics/.wharf/schema.json");
    }
}
