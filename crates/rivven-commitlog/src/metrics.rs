//! Commit log metrics
//!
//! Uses the `metrics` crate facade; without an installed recorder every call
//! is a no-op. All metrics follow the pattern `rivven_commitlog_{name}_{unit}`.

use std::time::{Duration, Instant};

// ============================================================================
// Commit Log Metrics
// ============================================================================

/// Commit log metrics
pub struct LogMetrics;

impl LogMetrics {
    /// Batches appended
    pub fn increment_appends() {
        metrics::counter!("rivven_commitlog_appends_total").increment(1);
    }

    /// Bytes appended to data files
    pub fn add_append_bytes(bytes: u64) {
        metrics::counter!("rivven_commitlog_append_bytes_total").increment(bytes);
    }

    /// Appends that returned an error
    pub fn increment_append_errors() {
        metrics::counter!("rivven_commitlog_append_errors_total").increment(1);
    }

    /// Segment rotations
    pub fn increment_rotations() {
        metrics::counter!("rivven_commitlog_rotations_total").increment(1);
    }

    /// Index entries rebuilt while opening a log
    pub fn add_recovered_entries(count: u64) {
        metrics::counter!("rivven_commitlog_recovered_entries_total").increment(count);
    }

    /// Current number of segments
    pub fn set_segment_count(count: usize) {
        metrics::gauge!("rivven_commitlog_segments").set(count as f64);
    }

    /// Append latency in microseconds
    pub fn record_append_latency_us(us: u64) {
        metrics::histogram!("rivven_commitlog_append_latency_us").record(us as f64);
    }
}

// ============================================================================
// Timer Utility
// ============================================================================

/// Timer for measuring append durations
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Create a new timer starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed Duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed time in microseconds
    pub fn elapsed_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
