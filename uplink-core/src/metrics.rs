//! Uplink metrics
//!
//! Components report through a [`MetricsCollector`] handed to them by the
//! session. [`RecorderMetrics`] forwards to the `metrics` facade, so any
//! installed recorder (Prometheus, statsd, ...) picks the values up.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Metric names as constants
pub mod names {
    // Segment metrics
    pub const SEGMENTS_UPLOADED: &str = "uplink_segments_uploaded_total";
    pub const SEGMENTS_INLINE: &str = "uplink_segments_inline_total";
    pub const SEGMENTS_UNDER_REPLICATED: &str = "uplink_segments_under_replicated_total";
    pub const SEGMENTS_DOWNLOADED: &str = "uplink_segments_downloaded_total";
    pub const SEGMENTS_DELETED: &str = "uplink_segments_deleted_total";

    // Encryption metrics
    pub const BLOCKS_ENCRYPTED: &str = "uplink_blocks_encrypted_total";
    pub const BLOCKS_DECRYPTED: &str = "uplink_blocks_decrypted_total";

    // Piece metrics
    pub const PIECES_UPLOADED: &str = "uplink_pieces_uploaded_total";
    pub const PIECE_UPLOAD_FAILURES: &str = "uplink_piece_upload_failures_total";
    pub const PIECES_DOWNLOADED: &str = "uplink_pieces_downloaded_total";
    pub const PIECE_DOWNLOAD_FAILURES: &str = "uplink_piece_download_failures_total";
    pub const PIECES_DELETED: &str = "uplink_pieces_deleted_total";
    pub const PIECE_DELETE_FAILURES: &str = "uplink_piece_delete_failures_total";
    pub const LONG_TAIL_CANCELLED: &str = "uplink_long_tail_cancelled_total";

    // Stream metrics
    pub const BYTES_UPLOADED: &str = "uplink_bytes_uploaded_total";
    pub const BYTES_DOWNLOADED: &str = "uplink_bytes_downloaded_total";
    pub const UPLOAD_DURATION: &str = "uplink_segment_upload_duration_seconds";
    pub const DOWNLOAD_DURATION: &str = "uplink_segment_download_duration_seconds";
    pub const CLEANUP_FAILURES: &str = "uplink_cleanup_failures_total";
}

/// Initialize metric descriptions
pub fn describe_metrics() {
    describe_counter!(names::SEGMENTS_UPLOADED, "Segments committed");
    describe_counter!(
        names::SEGMENTS_INLINE,
        "Segments stored inline in their pointer"
    );
    describe_counter!(
        names::SEGMENTS_UNDER_REPLICATED,
        "Remote segments stored on fewer than the optimal number of pieces"
    );
    describe_counter!(names::SEGMENTS_DOWNLOADED, "Segments read");
    describe_counter!(names::SEGMENTS_DELETED, "Segments deleted");

    describe_counter!(names::BLOCKS_ENCRYPTED, "Encryption blocks sealed");
    describe_counter!(names::BLOCKS_DECRYPTED, "Encryption blocks opened");

    describe_counter!(names::PIECES_UPLOADED, "Pieces acknowledged by nodes");
    describe_counter!(
        names::PIECE_UPLOAD_FAILURES,
        "Piece upload attempts that failed"
    );
    describe_counter!(names::PIECES_DOWNLOADED, "Verified pieces downloaded");
    describe_counter!(
        names::PIECE_DOWNLOAD_FAILURES,
        "Piece downloads that failed or did not verify"
    );
    describe_counter!(names::PIECES_DELETED, "Pieces deleted");
    describe_counter!(names::PIECE_DELETE_FAILURES, "Piece deletes that failed");
    describe_counter!(
        names::LONG_TAIL_CANCELLED,
        "Piece uploads cancelled after the optimal threshold was reached"
    );

    describe_counter!(names::BYTES_UPLOADED, "Plaintext bytes uploaded");
    describe_counter!(names::BYTES_DOWNLOADED, "Plaintext bytes returned to readers");
    describe_histogram!(
        names::UPLOAD_DURATION,
        "Time to store one remote segment in seconds"
    );
    describe_histogram!(
        names::DOWNLOAD_DURATION,
        "Time to fetch and decode one remote segment in seconds"
    );
    describe_counter!(
        names::CLEANUP_FAILURES,
        "Best-effort cleanup steps that failed"
    );
}

/// Sink for counters and timings
pub trait MetricsCollector: Send + Sync {
    fn increment(&self, name: &'static str, value: u64);

    fn observe(&self, name: &'static str, value: f64);
}

/// Forwards to the global `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderMetrics;

impl MetricsCollector for RecorderMetrics {
    fn increment(&self, name: &'static str, value: u64) {
        counter!(name).increment(value);
    }

    fn observe(&self, name: &'static str, value: f64) {
        histogram!(name).record(value);
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsCollector for NoopMetrics {
    fn increment(&self, _name: &'static str, _value: u64) {}

    fn observe(&self, _name: &'static str, _value: f64) {}
}

/// Keeps totals in memory so they can be inspected
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
    observations: Mutex<HashMap<&'static str, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented)
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    /// Recorded observations of a histogram
    pub fn observations(&self, name: &str) -> Vec<f64> {
        self.observations.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn reset(&self) {
        self.counters.lock().clear();
        self.observations.lock().clear();
    }
}

impl MetricsCollector for InMemoryMetrics {
    fn increment(&self, name: &'static str, value: u64) {
        *self.counters.lock().entry(name).or_insert(0) += value;
    }

    fn observe(&self, name: &'static str, value: f64) {
        self.observations.lock().entry(name).or_default().push(value);
    }
}
