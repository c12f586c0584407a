//! Metrics for the CL sync payload buffer.

use alloy_eips::BlockNumHash;

/// Container for metric names used by this crate.
#[derive(Debug, Clone, Copy)]
pub struct Metrics;

impl Metrics {
    /// Gauge: number of buffered unsafe payloads.
    pub const UNSAFE_PAYLOADS_BUFFER_LENGTH: &str = "clsync_unsafe_payloads_buffer_length";
    /// Gauge: estimated memory held by buffered unsafe payloads.
    pub const UNSAFE_PAYLOADS_BUFFER_MEMORY: &str = "clsync_unsafe_payloads_buffer_memory";
    /// Gauge: block height of the next buffered unsafe payload.
    pub const UNSAFE_PAYLOADS_BUFFER_NEXT: &str = "clsync_unsafe_payloads_buffer_next";

    /// Initializes metrics for this crate.
    pub fn init() {
        Self::describe();
        Self::zero();
    }

    /// Describes the metrics used in this crate.
    pub fn describe() {
        metrics::describe_gauge!(
            Self::UNSAFE_PAYLOADS_BUFFER_LENGTH,
            "Number of buffered unsafe payloads"
        );
        metrics::describe_gauge!(
            Self::UNSAFE_PAYLOADS_BUFFER_MEMORY,
            "Estimated memory held by buffered unsafe payloads, in bytes"
        );
        metrics::describe_gauge!(
            Self::UNSAFE_PAYLOADS_BUFFER_NEXT,
            "Block height of the next buffered unsafe payload"
        );
    }

    /// Initializes metrics to `0` so they appear in the metrics endpoint before the
    /// first payload arrives.
    pub fn zero() {
        metrics::gauge!(Self::UNSAFE_PAYLOADS_BUFFER_LENGTH).set(0);
        metrics::gauge!(Self::UNSAFE_PAYLOADS_BUFFER_MEMORY).set(0);
        metrics::gauge!(Self::UNSAFE_PAYLOADS_BUFFER_NEXT).set(0);
    }
}

/// Sink for payload-buffer gauge updates.
pub trait QueueMetrics: Send + Sync {
    /// Records the state of the payload buffer after a mutation.
    fn record_unsafe_payloads_buffer(&self, length: usize, mem_size: u64, next: BlockNumHash);
}

/// [`QueueMetrics`] backed by the global metrics recorder.
#[derive(Debug, Default, Clone, Copy)]
pub struct GaugeQueueMetrics;

impl QueueMetrics for GaugeQueueMetrics {
    fn record_unsafe_payloads_buffer(&self, length: usize, mem_size: u64, next: BlockNumHash) {
        metrics::gauge!(Metrics::UNSAFE_PAYLOADS_BUFFER_LENGTH).set(length as f64);
        metrics::gauge!(Metrics::UNSAFE_PAYLOADS_BUFFER_MEMORY).set(mem_size as f64);
        metrics::gauge!(Metrics::UNSAFE_PAYLOADS_BUFFER_NEXT).set(next.number as f64);
    }
}
