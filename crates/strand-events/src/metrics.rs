//! Observability metrics for the event repository.
//!
//! Exported via the `metrics` crate facade. To export to Prometheus, install
//! a recorder (e.g. `metrics_exporter_prometheus`) at process startup.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `strand_events_spans_written_total` | Counter | `path` | Span rows persisted |
//! | `strand_events_batches_total` | Counter | `trigger`, `result` | Flush batches by outcome |
//! | `strand_events_flush_duration_seconds` | Histogram | - | Flush callback latency |
//! | `strand_events_publishes_total` | Counter | - | Broker notifications published |
//! | `strand_events_trace_subscribers` | Gauge | - | Live trace subscriptions |
//! | `strand_events_truncated_rows_total` | Counter | - | Rows removed by retention |

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: span rows persisted.
    pub const SPANS_WRITTEN_TOTAL: &str = "strand_events_spans_written_total";
    /// Counter: flush batches by trigger and outcome.
    pub const BATCHES_TOTAL: &str = "strand_events_batches_total";
    /// Histogram: flush callback latency in seconds.
    pub const FLUSH_DURATION_SECONDS: &str = "strand_events_flush_duration_seconds";
    /// Counter: broker notifications published.
    pub const PUBLISHES_TOTAL: &str = "strand_events_publishes_total";
    /// Gauge: live trace subscriptions.
    pub const TRACE_SUBSCRIBERS: &str = "strand_events_trace_subscribers";
    /// Counter: rows removed by the retention sweep.
    pub const TRUNCATED_ROWS_TOTAL: &str = "strand_events_truncated_rows_total";
}

/// Label keys and well-known values used across metrics.
pub mod labels {
    /// Write path (scheduled or immediate).
    pub const PATH: &str = "path";
    /// Scheduled (batched) write path.
    pub const PATH_SCHEDULED: &str = "scheduled";
    /// Immediate write path.
    pub const PATH_IMMEDIATE: &str = "immediate";
    /// Flush trigger kind.
    pub const TRIGGER: &str = "trigger";
    /// Size-triggered flush.
    pub const TRIGGER_SIZE: &str = "size";
    /// Interval-triggered flush.
    pub const TRIGGER_INTERVAL: &str = "interval";
    /// Shutdown-triggered flush.
    pub const TRIGGER_SHUTDOWN: &str = "shutdown";
    /// Flush outcome.
    pub const RESULT: &str = "result";
    /// Batch delivered to storage.
    pub const RESULT_FLUSHED: &str = "flushed";
    /// Batch discarded after a callback failure.
    pub const RESULT_DROPPED: &str = "dropped";
}

/// High-level interface for recording event-repository metrics.
///
/// Cheap to clone and share across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventMetrics;

impl EventMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Records persisted span rows.
    pub fn record_spans_written(&self, path: &'static str, count: usize) {
        counter!(names::SPANS_WRITTEN_TOTAL, labels::PATH => path).increment(count as u64);
    }

    /// Records broker notifications published.
    pub fn record_publishes(&self, count: usize) {
        counter!(names::PUBLISHES_TOTAL).increment(count as u64);
    }

    /// Updates the live trace subscriber gauge.
    #[allow(clippy::cast_precision_loss)] // Gauge values are small
    pub fn set_trace_subscribers(&self, count: usize) {
        gauge!(names::TRACE_SUBSCRIBERS).set(count as f64);
    }

    /// Records rows removed by the retention sweep.
    pub fn record_truncated_rows(&self, count: u64) {
        counter!(names::TRUNCATED_ROWS_TOTAL).increment(count);
    }
}
