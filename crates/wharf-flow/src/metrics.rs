//! Observability metrics for the upload control plane.
//!
//! Metrics are exposed via the `metrics` crate facade. Names and labels
//! are constants so dashboards and alerts stay stable.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `wharf_flow_uploads_total` | Counter | `status` | Upload terminal outcomes |
//! | `wharf_flow_upload_phase_duration_seconds` | Histogram | `phase` | Time spent per phase |
//! | `wharf_flow_scheduler_ticks_total` | Counter | `outcome` | Scheduler tick outcomes |
//! | `wharf_flow_tables_loaded_total` | Counter | `result` | Per-table load outcomes |
//! | `wharf_flow_discarded_values_total` | Counter | - | Values routed to the discards table |
//! | `wharf_flow_admission_skips_total` | Counter | `reason` | Admission denials |
//! | `wharf_flow_active_routers` | Gauge | - | Routers currently running |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: upload terminal outcomes by status.
    pub const UPLOADS_TOTAL: &str = "wharf_flow_uploads_total";
    /// Histogram: time spent per upload phase in seconds.
    pub const UPLOAD_PHASE_DURATION_SECONDS: &str = "wharf_flow_upload_phase_duration_seconds";
    /// Counter: scheduler tick outcomes.
    pub const SCHEDULER_TICKS_TOTAL: &str = "wharf_flow_scheduler_ticks_total";
    /// Counter: per-table load outcomes.
    pub const TABLES_LOADED_TOTAL: &str = "wharf_flow_tables_loaded_total";
    /// Counter: values routed to the discards table.
    pub const DISCARDED_VALUES_TOTAL: &str = "wharf_flow_discarded_values_total";
    /// Counter: admission denials by reason.
    pub const ADMISSION_SKIPS_TOTAL: &str = "wharf_flow_admission_skips_total";
    /// Gauge: routers currently running.
    pub const ACTIVE_ROUTERS: &str = "wharf_flow_active_routers";
}

/// Label keys used across metrics.
pub mod labels {
    /// Terminal upload status (exported_data, aborted).
    pub const STATUS: &str = "status";
    /// Upload phase (generating_load_files, exporting_data, ...).
    pub const PHASE: &str = "phase";
    /// Tick outcome (created, skipped, locked, error).
    pub const OUTCOME: &str = "outcome";
    /// Per-table load result (exported, failed, aborted).
    pub const RESULT: &str = "result";
    /// Admission denial reason (global, destination_type, destination).
    pub const REASON: &str = "reason";
}

/// Records one upload terminal outcome.
pub fn record_upload_outcome(status: &'static str) {
    counter!(names::UPLOADS_TOTAL, labels::STATUS => status).increment(1);
}

/// Records the duration of one upload phase.
pub fn observe_phase_duration(phase: &'static str, duration: Duration) {
    histogram!(names::UPLOAD_PHASE_DURATION_SECONDS, labels::PHASE => phase)
        .record(duration.as_secs_f64());
}

/// Records one scheduler tick outcome.
pub fn record_scheduler_tick(outcome: &'static str) {
    counter!(names::SCHEDULER_TICKS_TOTAL, labels::OUTCOME => outcome).increment(1);
}

/// Records one per-table load outcome.
pub fn record_table_load(result: &'static str) {
    counter!(names::TABLES_LOADED_TOTAL, labels::RESULT => result).increment(1);
}

/// Records values routed to the discards table.
pub fn record_discards(count: u64) {
    if count > 0 {
        counter!(names::DISCARDED_VALUES_TOTAL).increment(count);
    }
}

/// Records one admission denial.
pub fn record_admission_skip(reason: &'static str) {
    counter!(names::ADMISSION_SKIPS_TOTAL, labels::REASON => reason).increment(1);
}

/// Updates the active-router gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_routers(count: usize) {
    gauge!(names::ACTIVE_ROUTERS).set(count as f64);
}

/// Guard that reports elapsed time to a callback on drop.
pub struct TimingGuard<F: Fn(Duration)> {
    started: Instant,
    report: F,
}

impl<F: Fn(Duration)> TimingGuard<F> {
    /// Starts timing; `report` runs when the guard drops.
    #[must_use]
    pub fn new(report: F) -> Self {
        Self {
            started: Instant::now(),
            report,
        }
    }
}

impl<F: Fn(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        (self.report)(self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn timing_guard_reports_on_drop() {
        let reported = Arc::new(AtomicBool::new(false));
        {
            let reported = Arc::clone(&reported);
            let _guard = TimingGuard::new(move |_| reported.store(true, Ordering::SeqCst));
        }
        assert!(reported.load(Ordering::SeqCst));
    }

    #[test]
    fn recording_helpers_do_not_panic_without_a_recorder() {
        record_upload_outcome("exported_data");
        observe_phase_duration("exporting_data", Duration::from_millis(5));
        record_scheduler_tick("created");
        record_table_load("exported");
        record_discards(3);
        record_admission_skip("destination");
        set_active_routers(2);
    }
}
