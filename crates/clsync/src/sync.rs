//! The CL sync actor.
//!
//! Buffers unsafe payloads gossiped ahead of the unsafe head and feeds them to the
//! engine one at a time, in order, whenever a forkchoice update shows the next one has
//! become applicable.

use std::sync::Arc;

use alloy_eips::BlockNumHash;
use async_trait::async_trait;
use kona_genesis::RollupConfig;
use kona_protocol::L2BlockInfo;
use op_alloy_rpc_types_engine::OpExecutionPayloadEnvelope;
use rollup_engine::{Event, EventEmitter, EventHandler, ForkchoiceRequester};
use tokio::sync::Mutex;

use crate::{PayloadsQueue, QueueMetrics};

/// The CL sync actor.
///
/// Consumes received-unsafe-payload events from the network, reacts to
/// forkchoice updates by handing the next applicable payload to the engine, and
/// drops payloads the engine rejected. A queued payload stays queued until it is
/// either applied (overtaken by the unsafe head) or invalidated; processing is
/// therefore naturally retried while the engine reports transient errors.
pub struct ClSync {
    cfg: Arc<RollupConfig>,
    metrics: Arc<dyn QueueMetrics>,
    emitter: Arc<dyn EventEmitter>,
    engine: Arc<dyn ForkchoiceRequester>,
    payloads: Mutex<PayloadsQueue>,
}

impl std::fmt::Debug for ClSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClSync").field("payloads", &self.payloads).finish_non_exhaustive()
    }
}

impl ClSync {
    /// Creates a new [`ClSync`] with an empty payload buffer.
    pub fn new(
        cfg: Arc<RollupConfig>,
        metrics: Arc<dyn QueueMetrics>,
        emitter: Arc<dyn EventEmitter>,
        engine: Arc<dyn ForkchoiceRequester>,
    ) -> Self {
        Self { cfg, metrics, emitter, engine, payloads: Mutex::new(PayloadsQueue::new()) }
    }

    /// The lowest queued unsafe block, or the default block ref if the queue is empty
    /// or its head cannot be decoded.
    pub async fn lowest_queued_unsafe_block(&self) -> L2BlockInfo {
        let payloads = self.payloads.lock().await;
        let Some(envelope) = payloads.peek() else {
            return L2BlockInfo::default();
        };
        L2BlockInfo::from_payload_and_genesis(
            envelope.execution_payload.clone(),
            envelope.parent_beacon_block_root,
            &self.cfg.genesis,
        )
        .unwrap_or_default()
    }

    fn record(&self, payloads: &PayloadsQueue) {
        let next = payloads
            .peek()
            .map(|envelope| BlockNumHash {
                hash: envelope.execution_payload.block_hash(),
                number: envelope.execution_payload.block_number(),
            })
            .unwrap_or_default();
        self.metrics.record_unsafe_payloads_buffer(payloads.len(), payloads.mem_size(), next);
    }

    /// Buffers a payload received from the network and asks the engine for its current
    /// forkchoice, which circles back as a forkchoice-update event.
    async fn on_unsafe_payload(&self, envelope: Option<Arc<OpExecutionPayloadEnvelope>>) {
        let Some(envelope) = envelope else {
            warn!(target: "clsync", "Received empty unsafe payload");
            return;
        };
        debug!(
            target: "clsync",
            number = envelope.execution_payload.block_number(),
            hash = %envelope.execution_payload.block_hash(),
            "Received unsafe payload"
        );
        {
            let mut payloads = self.payloads.lock().await;
            if let Err(err) = payloads.push(envelope) {
                warn!(target: "clsync", %err, "Failed to buffer unsafe payload");
                return;
            }
            self.record(&payloads);
        }
        self.engine.request_forkchoice_update().await;
    }

    /// Reacts to a new forkchoice: drops payloads the head overtook, and hands the
    /// next payload to the engine if it directly extends the unsafe head.
    ///
    /// The payload is not popped here; it leaves the queue once a later forkchoice
    /// update shows it was applied, or an invalid-payload event rejects it.
    async fn on_forkchoice_update(&self, unsafe_head: L2BlockInfo) {
        let mut payloads = self.payloads.lock().await;
        payloads.drop_inapplicable(unsafe_head.block_info.number);
        self.record(&payloads);

        let Some(next) = payloads.peek() else {
            return;
        };
        let extends_head = next.execution_payload.parent_hash() == unsafe_head.block_info.hash
            && next.execution_payload.block_number() == unsafe_head.block_info.number + 1;
        if extends_head {
            self.emitter.emit(Event::ProcessUnsafePayload { envelope: Arc::clone(next) });
        }
    }

    /// Drops the queue head if it is the payload the engine rejected.
    async fn on_invalid_payload(&self, envelope: &Arc<OpExecutionPayloadEnvelope>) {
        let mut payloads = self.payloads.lock().await;
        let head_is_invalid = payloads.peek().is_some_and(|next| {
            next.execution_payload.block_hash() == envelope.execution_payload.block_hash()
        });
        if head_is_invalid {
            warn!(
                target: "clsync",
                number = envelope.execution_payload.block_number(),
                hash = %envelope.execution_payload.block_hash(),
                "Dropping invalid unsafe payload"
            );
            payloads.pop();
            self.record(&payloads);
        }
    }
}

#[async_trait]
impl EventHandler for ClSync {
    async fn on_event(&self, event: &Event) -> bool {
        match event {
            Event::ReceivedUnsafePayload(envelope) => {
                self.on_unsafe_payload(envelope.clone()).await;
            }
            Event::ForkchoiceUpdate { unsafe_head, .. } => {
                self.on_forkchoice_update(*unsafe_head).await;
            }
            Event::PayloadInvalid { envelope } => self.on_invalid_payload(envelope).await,
            _ => return false,
        }
        true
    }
}
