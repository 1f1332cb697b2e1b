//! Admission control for upload workers.
//!
//! Three concurrency limits compose: global in-flight uploads, per
//! destination type, and per destination (default 1, which keeps uploads
//! strictly sequential within one pair). Selection is priority-fair:
//!
//! - the ready set is partitioned by destination
//! - a strict round-robin cursor across destinations picks the next
//!   eligible one; a destination at its cap is skipped, not dropped, so
//!   nothing starves
//! - within a destination the oldest eligible upload wins (priority asc,
//!   created_at asc, id asc)
//!
//! Slots are RAII: dropping the [`AdmissionSlot`] releases all three
//! counts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use wharf_core::id::{DestinationId, UploadId};
use wharf_core::warehouse::DestinationType;

use crate::metrics;
use crate::upload::Upload;

/// The three composed concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Maximum in-flight uploads across every destination.
    pub max_global: usize,
    /// Maximum in-flight uploads per destination type.
    pub max_per_destination_type: usize,
    /// Maximum in-flight uploads per destination. The default of 1 keeps
    /// uploads sequential within a (source, destination) pair.
    pub max_per_destination: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_global: 16,
            max_per_destination_type: 8,
            max_per_destination: 1,
        }
    }
}

/// One upload competing for admission.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The upload.
    pub upload_id: UploadId,
    /// Its destination.
    pub destination_id: DestinationId,
    /// Its destination type.
    pub destination_type: DestinationType,
    /// When the upload row was created.
    pub created_at: DateTime<Utc>,
    /// Scheduling priority (lower = higher priority).
    pub priority: i32,
}

impl From<&Upload> for Candidate {
    fn from(upload: &Upload) -> Self {
        Self {
            upload_id: upload.id,
            destination_id: upload.destination_id.clone(),
            destination_type: upload.destination_type,
            created_at: upload.created_at,
            priority: upload.metadata.priority,
        }
    }
}

#[derive(Debug, Default)]
struct Counts {
    global: usize,
    per_type: HashMap<DestinationType, usize>,
    per_destination: HashMap<DestinationId, usize>,
    cursor: usize,
}

/// Slot-accounting admission controller shared by every router.
#[derive(Debug)]
pub struct AdmissionController {
    limits: AdmissionLimits,
    counts: Mutex<Counts>,
}

impl AdmissionController {
    /// Creates a controller with the given limits.
    #[must_use]
    pub fn new(limits: AdmissionLimits) -> Self {
        Self {
            limits,
            counts: Mutex::new(Counts::default()),
        }
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Returns the number of in-flight uploads.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.counts.lock().map_or(0, |counts| counts.global)
    }

    /// Picks the next admissible upload from the candidates and reserves
    /// its slots.
    ///
    /// Returns `None` when nothing is admissible right now (empty set or
    /// every candidate capped). The returned slot releases its counts on
    /// drop.
    #[must_use]
    pub fn try_admit(
        self: &Arc<Self>,
        candidates: &[Candidate],
    ) -> Option<(UploadId, AdmissionSlot)> {
        if candidates.is_empty() {
            return None;
        }

        // Partition by destination; BTreeMap keeps destination order
        // deterministic for the cursor.
        let mut by_destination: BTreeMap<&DestinationId, Vec<&Candidate>> = BTreeMap::new();
        for candidate in candidates {
            by_destination
                .entry(&candidate.destination_id)
                .or_default()
                .push(candidate);
        }
        let destinations: Vec<&DestinationId> = by_destination.keys().copied().collect();

        let mut counts = self.counts.lock().ok()?;
        if counts.global >= self.limits.max_global {
            metrics::record_admission_skip("global");
            return None;
        }

        let start = counts.cursor % destinations.len();
        for offset in 0..destinations.len() {
            let index = (start + offset) % destinations.len();
            let destination_id = destinations[index];
            let group = &by_destination[destination_id];

            let destination_count = counts
                .per_destination
                .get(destination_id)
                .copied()
                .unwrap_or(0);
            if destination_count >= self.limits.max_per_destination {
                metrics::record_admission_skip("destination");
                continue;
            }

            let best = group
                .iter()
                .min_by_key(|c| (c.priority, c.created_at, c.upload_id))?;

            let type_count = counts
                .per_type
                .get(&best.destination_type)
                .copied()
                .unwrap_or(0);
            if type_count >= self.limits.max_per_destination_type {
                metrics::record_admission_skip("destination_type");
                continue;
            }

            counts.global += 1;
            *counts.per_type.entry(best.destination_type).or_default() += 1;
            *counts
                .per_destination
                .entry(best.destination_id.clone())
                .or_default() += 1;
            counts.cursor = index + 1;

            return Some((
                best.upload_id,
                AdmissionSlot {
                    controller: Arc::clone(self),
                    destination_type: best.destination_type,
                    destination_id: best.destination_id.clone(),
                },
            ));
        }
        None
    }

    fn release(&self, destination_type: DestinationType, destination_id: &DestinationId) {
        let Ok(mut counts) = self.counts.lock() else {
            return;
        };
        counts.global = counts.global.saturating_sub(1);
        if let Some(count) = counts.per_type.get_mut(&destination_type) {
            *count = count.saturating_sub(1);
        }
        if let Some(count) = counts.per_destination.get_mut(destination_id) {
            *count = count.saturating_sub(1);
        }
    }
}

/// A reserved admission slot; releases its counts on drop.
#[derive(Debug)]
pub struct AdmissionSlot {
    controller: Arc<AdmissionController>,
    destination_type: DestinationType,
    destination_id: DestinationId,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller
            .release(self.destination_type, &self.destination_id);
    }
}
