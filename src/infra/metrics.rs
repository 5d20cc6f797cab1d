//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap).
//!
//! NOTE: All atomics use Relaxed ordering intentionally: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::types::MatchEventType;
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
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
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
    /// Total observations evaluated (monotonic)
    observations_total: AtomicU64,
    /// Observations since last report (reset on report)
    observations_since_report: AtomicU64,
    /// Sum of evaluation latencies in microseconds (reset on report)
    latency_sum_us: AtomicU64,
    /// Max evaluation latency in microseconds (reset on report)
    latency_max_us: AtomicU64,
    /// Evaluation latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Observations rejected as invalid (monotonic)
    observations_rejected: AtomicU64,
    /// Region definitions inserted or replaced (monotonic)
    regions_upserted: AtomicU64,
    /// Region removals applied (monotonic)
    regions_removed: AtomicU64,
    /// Region updates rejected for bad geometry (monotonic)
    regions_rejected: AtomicU64,
    /// Regions purged after their timeout (monotonic)
    regions_expired: AtomicU64,
    /// Inbound JSON records that did not fit the schema (monotonic)
    records_malformed: AtomicU64,
    /// Inbound records dropped because an input channel was full (monotonic)
    ingress_dropped: AtomicU64,
    /// Outbound events dropped because the egress channel was full (monotonic)
    egress_dropped: AtomicU64,
    /// ENTER events emitted (monotonic)
    enter_events: AtomicU64,
    /// EXIT events emitted (monotonic)
    exit_events: AtomicU64,
    /// HANGOUT events emitted (monotonic)
    hangout_events: AtomicU64,
    /// Exits caused by a membership pointing at a deleted region (monotonic)
    stale_region_exits: AtomicU64,
    /// Regions currently in the store (gauge)
    active_regions: AtomicU64,
    /// Devices currently held across all partitions (gauge)
    tracked_devices: AtomicU64,
    /// Current observation queue depth (updated by sampler)
    observation_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            observations_total: AtomicU64::new(0),
            observations_since_report: AtomicU64::new(0),
            latency_sum_us: AtomicU64::new(0),
            latency_max_us: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            observations_rejected: AtomicU64::new(0),
            regions_upserted: AtomicU64::new(0),
            regions_removed: AtomicU64::new(0),
            regions_rejected: AtomicU64::new(0),
            regions_expired: AtomicU64::new(0),
            records_malformed: AtomicU64::new(0),
            ingress_dropped: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            enter_events: AtomicU64::new(0),
            exit_events: AtomicU64::new(0),
            hangout_events: AtomicU64::new(0),
            stale_region_exits: AtomicU64::new(0),
            active_regions: AtomicU64::new(0),
            tracked_devices: AtomicU64::new(0),
            observation_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an observation was evaluated with given latency (lock-free)
    #[inline]
    pub fn record_observation(&self, latency_us: u64) {
        self.observations_total.fetch_add(1, Ordering::Relaxed);
        self.observations_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        // Update histogram bucket
        let bucket = bucket_index(latency_us);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        // Update max
        update_atomic_max(&self.latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_observation_rejected(&self) {
        self.observations_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_event(&self, event_type: MatchEventType) {
        let counter = match event_type {
            MatchEventType::Enter => &self.enter_events,
            MatchEventType::Exit => &self.exit_events,
            MatchEventType::Hangout => &self.hangout_events,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stale_region_exit(&self) {
        self.stale_region_exits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_region_upserted(&self) {
        self.regions_upserted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_region_removed(&self) {
        self.regions_removed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_region_rejected(&self) {
        self.regions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_regions_expired(&self, count: u64) {
        self.regions_expired.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_malformed(&self) {
        self.records_malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an inbound record dropped due to channel full (lock-free)
    #[inline]
    pub fn record_ingress_dropped(&self) {
        self.ingress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an outbound event dropped due to channel full (lock-free)
    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_active_regions(&self, count: usize) {
        self.active_regions.store(count as u64, Ordering::Relaxed);
    }

    /// Apply a change in one partition's device count to the global gauge
    #[inline]
    pub fn adjust_tracked_devices(&self, before: usize, after: usize) {
        if after > before {
            self.tracked_devices.fetch_add((after - before) as u64, Ordering::Relaxed);
        } else if before > after {
            self.tracked_devices.fetch_sub((before - after) as u64, Ordering::Relaxed);
        }
    }

    /// Set current observation queue depth (called by sampler)
    #[inline]
    pub fn set_observation_queue_depth(&self, depth: u64) {
        self.observation_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn observations_total(&self) -> u64 {
        self.observations_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn observations_rejected(&self) -> u64 {
        self.observations_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn regions_rejected(&self) -> u64 {
        self.regions_rejected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn records_malformed(&self) -> u64 {
        self.records_malformed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn ingress_dropped(&self) -> u64 {
        self.ingress_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn events_total(&self, event_type: MatchEventType) -> u64 {
        match event_type {
            MatchEventType::Enter => self.enter_events.load(Ordering::Relaxed),
            MatchEventType::Exit => self.exit_events.load(Ordering::Relaxed),
            MatchEventType::Hangout => self.hangout_events.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn active_regions(&self) -> u64 {
        self.active_regions.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tracked_devices(&self) -> u64 {
        self.tracked_devices.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        self.summarize(true)
    }

    /// Same summary as `report` without resetting anything (for scrapes)
    pub fn snapshot(&self) -> MetricsSummary {
        self.summarize(false)
    }

    fn summarize(&self, reset: bool) -> MetricsSummary {
        let (observations_count, latency_sum, max_latency, lat_buckets) = if reset {
            // Swap periodic counters to zero and get their values
            (
                self.observations_since_report.swap(0, Ordering::Relaxed),
                self.latency_sum_us.swap(0, Ordering::Relaxed),
                self.latency_max_us.swap(0, Ordering::Relaxed),
                swap_buckets(&self.latency_buckets),
            )
        } else {
            (
                self.observations_since_report.load(Ordering::Relaxed),
                self.latency_sum_us.load(Ordering::Relaxed),
                self.latency_max_us.load(Ordering::Relaxed),
                load_buckets(&self.latency_buckets),
            )
        };

        // Calculate elapsed time, reset only when reporting
        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            if reset {
                *last = Instant::now();
            }
            elapsed
        };

        let observations_per_sec = if elapsed.as_secs_f64() > 0.0 {
            observations_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency =
            if observations_count > 0 { latency_sum / observations_count } else { 0 };

        MetricsSummary {
            observations_total: self.observations_total.load(Ordering::Relaxed),
            observations_per_sec,
            avg_latency_us: avg_latency,
            max_latency_us: max_latency,
            lat_buckets,
            lat_p50_us: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_us: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_us: percentile_from_buckets(&lat_buckets, 0.99),
            observations_rejected: self.observations_rejected.load(Ordering::Relaxed),
            regions_upserted: self.regions_upserted.load(Ordering::Relaxed),
            regions_removed: self.regions_removed.load(Ordering::Relaxed),
            regions_rejected: self.regions_rejected.load(Ordering::Relaxed),
            regions_expired: self.regions_expired.load(Ordering::Relaxed),
            records_malformed: self.records_malformed.load(Ordering::Relaxed),
            ingress_dropped: self.ingress_dropped.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            enter_events: self.enter_events.load(Ordering::Relaxed),
            exit_events: self.exit_events.load(Ordering::Relaxed),
            hangout_events: self.hangout_events.load(Ordering::Relaxed),
            stale_region_exits: self.stale_region_exits.load(Ordering::Relaxed),
            active_regions: self.active_regions.load(Ordering::Relaxed),
            tracked_devices: self.tracked_devices.load(Ordering::Relaxed),
            observation_queue_depth: self.observation_queue_depth.load(Ordering::Relaxed),
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
    pub observations_total: u64,
    pub observations_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Evaluation latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub observations_rejected: u64,
    pub regions_upserted: u64,
    pub regions_removed: u64,
    pub regions_rejected: u64,
    pub regions_expired: u64,
    pub records_malformed: u64,
    pub ingress_dropped: u64,
    pub egress_dropped: u64,
    pub enter_events: u64,
    pub exit_events: u64,
    pub hangout_events: u64,
    pub stale_region_exits: u64,
    pub active_regions: u64,
    pub tracked_devices: u64,
    pub observation_queue_depth: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            observations_total = %self.observations_total,
            observations_per_sec = format!("{:.1}", self.observations_per_sec),
            avg_latency_us = %self.avg_latency_us,
            max_latency_us = %self.max_latency_us,
            p99_us = %self.lat_p99_us,
            rejected = %self.observations_rejected,
            malformed = %self.records_malformed,
            regions = %self.active_regions,
            devices = %self.tracked_devices,
            enter = %self.enter_events,
            exit = %self.exit_events,
            hangout = %self.hangout_events,
            "metrics"
        );
    }
}
