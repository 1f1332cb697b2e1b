//! Schedule calculation: when is a warehouse due for an upload?
//!
//! Destinations sync on a daily grid derived from `syncFrequency` (minutes
//! between runs) and `syncStartAt` (HH:MM UTC): the grid is built by
//! walking forward and backward from the start time within `[0, 1440)`.
//! The grid is input-pure, so it is memoized in a process-global
//! read-mostly cache.
//!
//! Two acknowledged pieces of global state live here (and only here): the
//! scheduled-times cache and the `start_upload_always` flag toggled by
//! operator tooling.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use wharf_core::warehouse::Warehouse;

/// Minutes in a day.
const MINUTES_PER_DAY: u16 = 1440;

static SCHEDULED_TIMES_CACHE: LazyLock<RwLock<HashMap<(u32, u16), Arc<Vec<u16>>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

static START_UPLOAD_ALWAYS: AtomicBool = AtomicBool::new(false);

/// Forces every warehouse to be due immediately. Toggled by operator
/// tooling; read lock-free on every scheduler tick.
pub fn set_start_upload_always(enabled: bool) {
    START_UPLOAD_ALWAYS.store(enabled, Ordering::Relaxed);
}

/// Returns the current force-sync flag.
#[must_use]
pub fn start_upload_always() -> bool {
    START_UPLOAD_ALWAYS.load(Ordering::Relaxed)
}

/// Per-warehouse sync-now markers set by the admin surface.
///
/// A marked warehouse bypasses its schedule on the next tick; the
/// scheduler clears the marker once the upload row exists.
#[derive(Debug, Default)]
pub struct TriggerStore {
    marked: Mutex<HashSet<String>>,
}

impl TriggerStore {
    /// Creates an empty trigger store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a warehouse for immediate sync.
    pub fn mark(&self, identifier: &str) {
        if let Ok(mut marked) = self.marked.lock() {
            marked.insert(identifier.to_string());
        }
    }

    /// Returns true if the warehouse is marked.
    #[must_use]
    pub fn is_marked(&self, identifier: &str) -> bool {
        self.marked
            .lock()
            .map(|marked| marked.contains(identifier))
            .unwrap_or(false)
    }

    /// Clears the marker after the triggered upload is created.
    pub fn clear(&self, identifier: &str) {
        if let Ok(mut marked) = self.marked.lock() {
            marked.remove(identifier);
        }
    }
}

/// Scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfig {
    /// Fallback interval when a destination configures no
    /// `syncFrequency`/`syncStartAt` pair.
    #[serde(with = "humantime_serde")]
    pub default_sync_frequency: Duration,
    /// When set, ignore configured schedules entirely and gate on the
    /// default interval alone.
    #[serde(default)]
    pub ignore_sync_frequency: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            default_sync_frequency: Duration::from_secs(30 * 60),
            ignore_sync_frequency: false,
        }
    }
}

/// Why an upload was not created this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The current time lies inside the destination's exclude window.
    ExcludeWindow,
    /// The default interval since the last upload has not elapsed.
    UploadFrequencyNotExceeded,
    /// Schedules are ignored and the default interval has not elapsed.
    IgnoreSyncFrequencyNotExceeded,
    /// An upload was already created in the current schedule window.
    BeforeScheduledTime,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExcludeWindow => {
                write!(f, "exclude window: current time exists in exclude window")
            }
            Self::UploadFrequencyNotExceeded => write!(f, "upload frequency not exceeded"),
            Self::IgnoreSyncFrequencyNotExceeded => {
                write!(f, "ignore sync freq: upload frequency not exceeded")
            }
            Self::BeforeScheduledTime => write!(f, "before scheduled time"),
        }
    }
}

/// Parses an `HH:MM` string into minutes since the start of the day.
#[must_use]
pub fn mins_of_day(hhmm: &str) -> Option<u16> {
    let (hours, minutes) = hhmm.split_once(':')?;
    let hours: u16 = hours.parse().ok()?;
    let minutes: u16 = minutes.parse().ok()?;
    if hours >= 24 || minutes >= 60 {
        return None;
    }
    Some(hours * 60 + minutes)
}

fn minute_of_day(now: DateTime<Utc>) -> u16 {
    (now.hour() * 60 + now.minute()) as u16
}

/// Returns all daily scheduled minute offsets for the given frequency and
/// start minute, sorted ascending.
///
/// The grid walks forward and backward from `start_min` in `frequency_mins`
/// steps within `[0, 1440)`. Results are memoized: the function is
/// input-pure and called on every scheduler tick.
#[must_use]
pub fn scheduled_times(frequency_mins: u32, start_min: u16) -> Arc<Vec<u16>> {
    let key = (frequency_mins, start_min);
    if let Ok(cache) = SCHEDULED_TIMES_CACHE.read() {
        if let Some(times) = cache.get(&key) {
            return Arc::clone(times);
        }
    }

    let step = frequency_mins.max(1) as u16;
    let mut times = Vec::new();
    let mut min = start_min % MINUTES_PER_DAY;
    // Walk backward to the start of the day.
    while min >= step {
        min -= step;
        times.push(min);
    }
    times.reverse();
    // Then forward from the start minute.
    let mut min = start_min % MINUTES_PER_DAY;
    while min < MINUTES_PER_DAY {
        times.push(min);
        match min.checked_add(step) {
            Some(next) => min = next,
            None => break,
        }
    }

    let times = Arc::new(times);
    if let Ok(mut cache) = SCHEDULED_TIMES_CACHE.write() {
        cache.insert(key, Arc::clone(&times));
    }
    times
}

/// Returns the most recent scheduled instant at or before `now`.
///
/// If `now` equals a scheduled minute exactly, that instant is the
/// previous scheduled time. Before the day's earliest slot, the previous
/// day's last slot is returned.
#[must_use]
pub fn prev_scheduled_time(frequency_mins: u32, start_min: u16, now: DateTime<Utc>) -> DateTime<Utc> {
    let times = scheduled_times(frequency_mins, start_min);
    let current = minute_of_day(now);
    let start_of_day = now
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map_or(now, |dt| dt.and_utc());

    match times.iter().rev().find(|&&t| t <= current) {
        Some(&slot) => start_of_day + chrono::Duration::minutes(i64::from(slot)),
        None => {
            let last = times.last().copied().unwrap_or(0);
            start_of_day - chrono::Duration::days(1) + chrono::Duration::minutes(i64::from(last))
        }
    }
}

/// Returns true iff the minute-of-day of `now` lies within the exclude
/// window `[start, end]` (inclusive). When `start > end` the window wraps
/// past midnight. Missing or malformed bounds mean no window.
#[must_use]
pub fn in_exclude_window(now: DateTime<Utc>, start: Option<&str>, end: Option<&str>) -> bool {
    let (Some(start), Some(end)) = (start.and_then(mins_of_day), end.and_then(mins_of_day)) else {
        return false;
    };
    let current = minute_of_day(now);
    if start <= end {
        start <= current && current <= end
    } else {
        current >= start || current <= end
    }
}

fn frequency_exceeded(
    last_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    frequency: Duration,
) -> bool {
    let Some(last) = last_created_at else {
        return true;
    };
    let Ok(frequency) = chrono::Duration::from_std(frequency) else {
        return true;
    };
    now.signed_duration_since(last) >= frequency
}

/// Decides whether an upload may be created for the warehouse now.
///
/// The decision ladder:
///
/// 1. the `start_upload_always` flag wins
/// 2. a per-warehouse sync-now trigger wins
/// 3. with schedules ignored, gate on the default interval alone
/// 4. inside the exclude window, never
/// 5. without a configured (or parseable) frequency/start pair, gate on
///    the configured frequency when present, else the default interval
/// 6. otherwise: exactly one upload per schedule window, i.e. the last
///    upload must predate the previous scheduled time
///
/// # Errors
///
/// Returns the [`SkipReason`] surfaced to logs and the admin surface when
/// the warehouse is not due.
pub fn can_create_upload(
    warehouse: &Warehouse,
    last_created_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: &ScheduleConfig,
    triggers: &TriggerStore,
) -> std::result::Result<(), SkipReason> {
    if start_upload_always() {
        return Ok(());
    }
    if triggers.is_marked(&warehouse.identifier()) {
        return Ok(());
    }

    if config.ignore_sync_frequency {
        if frequency_exceeded(last_created_at, now, config.default_sync_frequency) {
            return Ok(());
        }
        return Err(SkipReason::IgnoreSyncFrequencyNotExceeded);
    }

    let destination_config = &warehouse.destination.config;
    let (window_start, window_end) = destination_config.exclude_window();
    if in_exclude_window(now, window_start.as_deref(), window_end.as_deref()) {
        return Err(SkipReason::ExcludeWindow);
    }

    let frequency_mins = destination_config
        .sync_frequency()
        .and_then(|f| f.parse::<u32>().ok())
        .filter(|f| *f > 0);
    let start_min = destination_config.sync_start_at().and_then(mins_of_day);

    let (Some(frequency_mins), Some(start_min)) = (frequency_mins, start_min) else {
        // No (usable) schedule: fall back to interval gating, preferring
        // the configured frequency when it parsed.
        let gate = frequency_mins.map_or(config.default_sync_frequency, |mins| {
            Duration::from_secs(u64::from(mins) * 60)
        });
        if frequency_exceeded(last_created_at, now, gate) {
            return Ok(());
        }
        return Err(SkipReason::UploadFrequencyNotExceeded);
    };

    let prev = prev_scheduled_time(frequency_mins, start_min, now);
    match last_created_at {
        Some(last) if last >= prev => Err(SkipReason::BeforeScheduledTime),
        _ => Ok(()),
    }
}
