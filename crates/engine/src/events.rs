//! The event vocabulary of the engine and its serialized dispatcher.

use std::{sync::Arc, time::Instant};

use alloy_eips::BlockNumHash;
use alloy_rpc_types_engine::PayloadId;
use async_trait::async_trait;
use kona_protocol::{BlockInfo, L2BlockInfo};
use op_alloy_rpc_types_engine::OpExecutionPayloadEnvelope;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::AttributesWithParent;

/// Events emitted and processed by the engine controller and its peers.
///
/// Payload envelopes are shared behind an [`Arc`] since the same envelope may be
/// queued, re-emitted and inspected by several handlers.
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
#[allow(clippy::large_enum_variant)]
pub enum Event {
    /// The forkchoice state was (or should be) pushed to the execution layer.
    #[display("forkchoice-update")]
    ForkchoiceUpdate {
        /// The unsafe head of the forkchoice.
        unsafe_head: L2BlockInfo,
        /// The safe head of the forkchoice.
        safe_head: L2BlockInfo,
        /// The finalized head of the forkchoice.
        finalized_head: L2BlockInfo,
    },
    /// The unsafe head was updated.
    #[display("unsafe-update")]
    UnsafeUpdate(L2BlockInfo),
    /// The given block may be promoted to cross-unsafe.
    #[display("promote-cross-unsafe")]
    PromoteCrossUnsafe(L2BlockInfo),
    /// The pending safe head was updated.
    #[display("pending-safe-update")]
    PendingSafeUpdate {
        /// The pending safe head.
        pending_safe: L2BlockInfo,
        /// The current unsafe head.
        unsafe_head: L2BlockInfo,
    },
    /// The local safe head was updated.
    #[display("local-safe-update")]
    LocalSafeUpdate {
        /// The new local safe head.
        block: L2BlockInfo,
        /// The L1 block the head was derived from.
        source: BlockInfo,
    },
    /// A block was promoted to (cross-)safe.
    #[display("safe-derived")]
    SafeDerived {
        /// The new safe head.
        safe: L2BlockInfo,
        /// The L1 block the head was derived from.
        source: BlockInfo,
    },
    /// The finalized head was updated.
    #[display("finalized-update")]
    FinalizedUpdate(L2BlockInfo),
    /// A forced engine reset completed. Carries the post-reset heads.
    #[display("engine-reset-confirmed")]
    EngineResetConfirmed {
        /// The local-unsafe head after the reset.
        local_unsafe: L2BlockInfo,
        /// The cross-unsafe head after the reset.
        cross_unsafe: L2BlockInfo,
        /// The local-safe head after the reset.
        local_safe: L2BlockInfo,
        /// The cross-safe head after the reset.
        cross_safe: L2BlockInfo,
        /// The finalized head after the reset.
        finalized: L2BlockInfo,
    },
    /// The execution layer rejected a payload as invalid.
    #[display("payload-invalid")]
    PayloadInvalid {
        /// The rejected payload.
        envelope: Arc<OpExecutionPayloadEnvelope>,
    },
    /// A transient engine failure; the triggering operation may be retried.
    #[display("engine-temporary-error")]
    TemporaryEngineError(String),
    /// An unrecoverable failure; the node should shut down.
    #[display("critical-error")]
    CriticalError(String),
    /// The engine state is inconsistent with the execution layer; a reset is needed.
    #[display("reset-requested")]
    ResetRequested(String),
    /// Request to reset the engine from the execution layer's forkchoice state.
    #[display("reset-engine-request")]
    ResetEngineRequest,
    /// An unsafe payload arrived from the network. `None` marks a malformed
    /// (empty) delivery and is rejected by the consumer.
    #[display("received-unsafe-payload")]
    ReceivedUnsafePayload(Option<Arc<OpExecutionPayloadEnvelope>>),
    /// A buffered unsafe payload extends the current unsafe head and should be
    /// inserted into the engine.
    #[display("process-unsafe-payload")]
    ProcessUnsafePayload {
        /// The payload to insert.
        envelope: Arc<OpExecutionPayloadEnvelope>,
    },
    /// Request to start a block-building job for the given attributes.
    #[display("build-start")]
    BuildStart {
        /// The attributes to build.
        attributes: AttributesWithParent,
    },
    /// The execution layer accepted a block-building job.
    #[display("build-started")]
    BuildStarted {
        /// The identifier of the building job.
        payload_id: PayloadId,
        /// The attributes being built.
        attributes: AttributesWithParent,
        /// When the build was started.
        build_started: Instant,
    },
    /// Request to seal the building job into a payload.
    #[display("build-seal")]
    BuildSeal {
        /// The identifier of the building job.
        payload_id: PayloadId,
        /// The attributes being built.
        attributes: AttributesWithParent,
        /// When the build was started.
        build_started: Instant,
    },
    /// A payload was sealed and is ready to be processed.
    #[display("build-sealed")]
    BuildSealed {
        /// The identifier of the building job.
        payload_id: PayloadId,
        /// The sealed payload.
        envelope: Arc<OpExecutionPayloadEnvelope>,
        /// The block ref of the sealed payload.
        block_ref: L2BlockInfo,
        /// The attributes the payload was built from.
        attributes: AttributesWithParent,
        /// When the build was started.
        build_started: Instant,
    },
    /// The execution layer rejected the attributes of a building job.
    #[display("build-invalid")]
    BuildInvalid {
        /// The rejected attributes.
        attributes: AttributesWithParent,
        /// The engine's validation error.
        reason: String,
    },
    /// Request to cancel a block-building job.
    #[display("build-cancel")]
    BuildCancel {
        /// The identifier of the building job.
        payload_id: PayloadId,
        /// The timestamp of the block being built.
        timestamp: u64,
    },
    /// A sealed payload should be submitted to the execution layer.
    #[display("payload-process")]
    PayloadProcess {
        /// The payload to process.
        envelope: Arc<OpExecutionPayloadEnvelope>,
        /// The block ref of the payload.
        block_ref: L2BlockInfo,
        /// Whether the payload concludes its span-batch.
        concluding: bool,
        /// The L1 block the payload was derived from, if it was derived.
        derived_from: Option<BlockInfo>,
        /// When the build was started.
        build_started: Instant,
    },
    /// The execution layer accepted a processed payload.
    #[display("payload-success")]
    PayloadSuccess {
        /// The accepted payload.
        envelope: Arc<OpExecutionPayloadEnvelope>,
        /// The block ref of the payload.
        block_ref: L2BlockInfo,
        /// Whether the payload concludes its span-batch.
        concluding: bool,
        /// The L1 block the payload was derived from, if it was derived.
        derived_from: Option<BlockInfo>,
    },
    /// Request to rebuild a derived block with its deposit transactions only
    /// (Holocene invalid-payload fallback).
    #[display("deposits-only-payload-attributes-request")]
    DepositsOnlyPayloadAttributesRequest {
        /// The parent of the block to rebuild.
        parent: BlockNumHash,
        /// The L1 block the original attributes were derived from.
        derived_from: BlockInfo,
    },
    /// Derived payload attributes were rejected by the execution layer.
    #[display("invalid-payload-attributes")]
    InvalidPayloadAttributes {
        /// The rejected attributes.
        attributes: AttributesWithParent,
    },
    /// The derivation pipeline may proceed after an engine reset.
    #[display("confirm-pipeline-reset")]
    ConfirmPipelineReset,
}

/// Emits [`Event`]s into the dispatch queue.
pub trait EventEmitter: Send + Sync {
    /// Queues the event for dispatch.
    fn emit(&self, event: Event);
}

/// Processes dispatched [`Event`]s.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles a single event. Returns whether the handler recognized the event.
    async fn on_event(&self, event: &Event) -> bool;
}

/// A channel-backed [`EventEmitter`] handed out by the [`EventSystem`].
#[derive(Debug, Clone)]
pub struct EventSender(mpsc::UnboundedSender<Event>);

impl EventEmitter for EventSender {
    fn emit(&self, event: Event) {
        if self.0.send(event).is_err() {
            warn!(target: "engine", "Event queue closed, dropping event");
        }
    }
}

/// Serialized event dispatcher.
///
/// Events are processed strictly in arrival order, one at a time. Every
/// registered handler sees every event; an event no handler recognizes is
/// logged and dropped.
pub struct EventSystem {
    /// The registered handlers, polled in registration order.
    handlers: Vec<Arc<dyn EventHandler>>,
    /// Sender side of the dispatch queue.
    tx: mpsc::UnboundedSender<Event>,
    /// Receiver side of the dispatch queue.
    rx: mpsc::UnboundedReceiver<Event>,
    /// Cancels the dispatch loop.
    cancellation: CancellationToken,
}

impl std::fmt::Debug for EventSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSystem").field("handlers", &self.handlers.len()).finish()
    }
}

impl EventSystem {
    /// Creates a new [`EventSystem`] with an empty handler set.
    pub fn new(cancellation: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { handlers: Vec::new(), tx, rx, cancellation }
    }

    /// Returns an [`EventSender`] feeding this system's queue.
    pub fn sender(&self) -> EventSender {
        EventSender(self.tx.clone())
    }

    /// Registers a handler. Handlers see events in registration order.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    /// Runs the dispatch loop until the cancellation token fires or every
    /// [`EventSender`] has been dropped.
    pub async fn run(self) {
        let Self { handlers, tx, mut rx, cancellation } = self;
        drop(tx);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!(target: "engine", "Event system received shutdown signal");
                    return;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        return;
                    };
                    trace!(target: "engine", event = %event, "Dispatching event");
                    let mut recognized = false;
                    for handler in &handlers {
                        recognized |= handler.on_event(&event).await;
                    }
                    if !recognized {
                        warn!(target: "engine", event = %event, "Event not recognized by any handler");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    struct RecordingHandler {
        seen: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn on_event(&self, event: &Event) -> bool {
            self.seen.lock().unwrap().push(event.clone());
            matches!(event, Event::ConfirmPipelineReset)
        }
    }

    struct CountingHandler {
        count: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn on_event(&self, _event: &Event) -> bool {
            self.count.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn test_dispatch_preserves_arrival_order() {
        let cancellation = CancellationToken::new();
        let mut system = EventSystem::new(cancellation.clone());
        let handler = Arc::new(RecordingHandler { seen: Mutex::new(Vec::new()) });
        system.register(handler.clone());

        let sender = system.sender();
        sender.emit(Event::ConfirmPipelineReset);
        sender.emit(Event::ResetEngineRequest);
        sender.emit(Event::ConfirmPipelineReset);
        drop(sender);

        // Closing all senders ends the loop after the queue drains.
        tokio::spawn(system.run()).await.unwrap();

        let seen = handler.seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![Event::ConfirmPipelineReset, Event::ResetEngineRequest, Event::ConfirmPipelineReset]
        );
    }

    #[tokio::test]
    async fn test_all_handlers_see_every_event() {
        let cancellation = CancellationToken::new();
        let mut system = EventSystem::new(cancellation.clone());
        let first = Arc::new(CountingHandler { count: AtomicUsize::new(0) });
        let second = Arc::new(CountingHandler { count: AtomicUsize::new(0) });
        system.register(first.clone());
        system.register(second.clone());

        let sender = system.sender();
        sender.emit(Event::ResetEngineRequest);
        sender.emit(Event::ConfirmPipelineReset);
        drop(sender);

        tokio::spawn(system.run()).await.unwrap();

        assert_eq!(first.count.load(Ordering::SeqCst), 2);
        assert_eq!(second.count.load(Ordering::SeqCst), 2);
    }
}
