//! Consensus-layer sync for an OP Stack rollup node.
//!
//! Unsafe payloads gossiped over the network arrive out of order and ahead of the
//! node's unsafe head. The [`ClSync`] actor buffers them in a bounded
//! [`PayloadsQueue`] and hands the next applicable payload to the engine whenever
//! a forkchoice update shows it directly extends the unsafe head.

#[macro_use]
extern crate tracing;

mod metrics;
pub use metrics::{GaugeQueueMetrics, Metrics, QueueMetrics};

mod queue;
pub use queue::{PayloadsQueue, PayloadsQueueError};

mod sync;
pub use sync::ClSync;
