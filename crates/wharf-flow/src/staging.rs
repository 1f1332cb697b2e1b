//! Staging-file metadata.
//!
//! Staging files are produced upstream: compressed JSON batches in object
//! storage, each with a metadata row recording its location, time range
//! and a compact schema snapshot. The scheduler claims contiguous id
//! ranges of these rows into uploads; monotonic ids keep event-time order
//! across batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use wharf_core::id::{DestinationId, SourceId, StagingFileId};
use wharf_core::schema::Schema;

/// A staging-file metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagingFile {
    /// Repository-assigned monotonic id.
    pub id: StagingFileId,
    /// Source that produced the batch.
    pub source_id: SourceId,
    /// Destination the batch is staged for.
    pub destination_id: DestinationId,
    /// Object-storage key of the batch.
    pub location: String,
    /// Compact schema snapshot of the batch.
    pub schema: Schema,
    /// Events in the batch.
    pub total_events: i64,
    /// Compressed size in bytes; the scheduler's per-upload byte cap sums
    /// this.
    pub size_bytes: i64,
    /// Earliest event time in the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_at: Option<DateTime<Utc>>,
    /// Latest event time in the batch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    /// When the metadata row was recorded.
    pub created_at: DateTime<Utc>,
}

/// A staging-file row before the repository assigns its id.
#[derive(Debug, Clone)]
pub struct StagingFileDraft {
    /// Source that produced the batch.
    pub source_id: SourceId,
    /// Destination the batch is staged for.
    pub destination_id: DestinationId,
    /// Object-storage key of the batch.
    pub location: String,
    /// Compact schema snapshot of the batch.
    pub schema: Schema,
    /// Events in the batch.
    pub total_events: i64,
    /// Compressed size in bytes.
    pub size_bytes: i64,
    /// Earliest event time in the batch.
    pub first_event_at: Option<DateTime<Utc>>,
    /// Latest event time in the batch.
    pub last_event_at: Option<DateTime<Utc>>,
}
