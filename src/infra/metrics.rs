//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::error::IngestError;
use crate::domain::events::AlertKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Fixes accepted into history (monotonic)
    fixes_total: AtomicU64,
    /// Fixes accepted since last report (reset on report)
    fixes_since_report: AtomicU64,
    /// Sum of ingest latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max ingest latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Ingest latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Fixes failing validation (monotonic)
    rejected_invalid: AtomicU64,
    /// Fixes older than the device's latest (monotonic)
    rejected_out_of_order: AtomicU64,
    /// Fixes discarded as impossible jumps (monotonic)
    rejected_jump: AtomicU64,
    /// Lines that did not parse as a fix (monotonic)
    parse_errors: AtomicU64,
    zone_entries_total: AtomicU64,
    zone_exits_total: AtomicU64,
    alerts_zone_total: AtomicU64,
    alerts_speed_total: AtomicU64,
    /// Fixes dropped because a worker queue was full (monotonic)
    fixes_dropped: AtomicU64,
    /// MQTT messages dropped due to channel full (monotonic)
    mqtt_events_dropped: AtomicU64,
    /// Fixes removed by retention (monotonic)
    fixes_pruned: AtomicU64,
    /// Current combined worker queue depth (updated by sampler)
    fix_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            fixes_total: AtomicU64::new(0),
            fixes_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            rejected_invalid: AtomicU64::new(0),
            rejected_out_of_order: AtomicU64::new(0),
            rejected_jump: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            zone_entries_total: AtomicU64::new(0),
            zone_exits_total: AtomicU64::new(0),
            alerts_zone_total: AtomicU64::new(0),
            alerts_speed_total: AtomicU64::new(0),
            fixes_dropped: AtomicU64::new(0),
            mqtt_events_dropped: AtomicU64::new(0),
            fixes_pruned: AtomicU64::new(0),
            fix_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an accepted fix with its ingest latency (lock-free)
    #[inline]
    pub fn record_fix_accepted(&self, latency_us: u64) {
        self.fixes_total.fetch_add(1, Ordering::Relaxed);
        self.fixes_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.latency_max_us, latency_us);
    }

    /// Count a rejected fix under its rejection reason
    #[inline]
    pub fn record_fix_rejected(&self, error: &IngestError) {
        let counter = match error {
            IngestError::Invalid(_) => &self.rejected_invalid,
            IngestError::OutOfOrder { .. } => &self.rejected_out_of_order,
            IngestError::ImpossibleJump { .. } => &self.rejected_jump,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_entry(&self) {
        self.zone_entries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_zone_exit(&self) {
        self.zone_exits_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an emitted alert by kind
    #[inline]
    pub fn record_alert(&self, kind: AlertKind) {
        match kind {
            AlertKind::Speed => self.alerts_speed_total.fetch_add(1, Ordering::Relaxed),
            _ => self.alerts_zone_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a fix dropped due to a full worker queue (lock-free)
    #[inline]
    pub fn record_fix_dropped(&self) {
        self.fixes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an MQTT event dropped due to channel full (lock-free)
    #[inline]
    pub fn record_mqtt_event_dropped(&self) {
        self.mqtt_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fixes_pruned(&self, count: u64) {
        self.fixes_pruned.fetch_add(count, Ordering::Relaxed);
    }

    /// Set current worker queue depth (called by sampler)
    #[inline]
    pub fn set_fix_queue_depth(&self, depth: u64) {
        self.fix_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn fixes_total(&self) -> u64 {
        self.fixes_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fixes_dropped(&self) -> u64 {
        self.fixes_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mqtt_events_dropped(&self) -> u64 {
        self.mqtt_events_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Total rejections across every reason
    pub fn rejected_total(&self) -> u64 {
        self.rejected_invalid.load(Ordering::Relaxed)
            + self.rejected_out_of_order.load(Ordering::Relaxed)
            + self.rejected_jump.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, devices: usize, zones: usize) -> MetricsSummary {
        let fixes_count = self.fixes_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_us.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let fixes_per_sec = if elapsed.as_secs_f64() > 0.0 {
            fixes_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if fixes_count > 0 { latency_sum / fixes_count } else { 0 };

        MetricsSummary {
            fixes_total: self.fixes_total.load(Ordering::Relaxed),
            fixes_per_sec,
            avg_ingest_latency_us: avg_latency,
            max_ingest_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            rejected_invalid: self.rejected_invalid.load(Ordering::Relaxed),
            rejected_out_of_order: self.rejected_out_of_order.load(Ordering::Relaxed),
            rejected_jump: self.rejected_jump.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            zone_entries_total: self.zone_entries_total.load(Ordering::Relaxed),
            zone_exits_total: self.zone_exits_total.load(Ordering::Relaxed),
            alerts_zone_total: self.alerts_zone_total.load(Ordering::Relaxed),
            alerts_speed_total: self.alerts_speed_total.load(Ordering::Relaxed),
            fixes_dropped: self.fixes_dropped.load(Ordering::Relaxed),
            mqtt_events_dropped: self.mqtt_events_dropped.load(Ordering::Relaxed),
            fixes_pruned: self.fixes_pruned.load(Ordering::Relaxed),
            fix_queue_depth: self.fix_queue_depth.load(Ordering::Relaxed),
            devices,
            zones,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for egress)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub fixes_total: u64,
    pub fixes_per_sec: f64,
    pub avg_ingest_latency_us: u64,
    pub max_ingest_latency_us: u64,
    /// Ingest latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub rejected_invalid: u64,
    pub rejected_out_of_order: u64,
    pub rejected_jump: u64,
    pub parse_errors: u64,
    pub zone_entries_total: u64,
    pub zone_exits_total: u64,
    pub alerts_zone_total: u64,
    pub alerts_speed_total: u64,
    pub fixes_dropped: u64,
    pub mqtt_events_dropped: u64,
    pub fixes_pruned: u64,
    pub fix_queue_depth: u64,
    /// Devices with state in memory
    pub devices: usize,
    /// Zones in the current set
    pub zones: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            fixes_total = %self.fixes_total,
            fixes_per_sec = format!("{:.1}", self.fixes_per_sec),
            avg_latency_us = %self.avg_ingest_latency_us,
            max_latency_us = %self.max_ingest_latency_us,
            p50_us = %self.lat_p50_us,
            p99_us = %self.lat_p99_us,
            rejected = %(self.rejected_invalid + self.rejected_out_of_order + self.rejected_jump),
            entries = %self.zone_entries_total,
            exits = %self.zone_exits_total,
            alerts = %(self.alerts_zone_total + self.alerts_speed_total),
            devices = %self.devices,
            queue_depth = %self.fix_queue_depth,
            "metrics"
        );
    }
}
