//! Block-building handlers of the [`EngineController`].
//!
//! A build goes through `build-start` -> `build-started` -> `build-seal` ->
//! `build-sealed` -> `payload-process`, each step an event so other components
//! can observe or interpose.

use std::{sync::Arc, time::Instant};

use alloy_rpc_types_engine::{
    ForkchoiceState, INVALID_PAYLOAD_ATTRIBUTES_ERROR, PayloadId, PayloadStatusEnum,
};
use kona_protocol::L2BlockInfo;
use op_alloy_rpc_types_engine::OpExecutionPayloadEnvelope;

use crate::{
    AttributesWithParent, EngineClient, EngineController, EngineControllerError,
    EngineForkchoiceVersion, Event,
};

/// JSON-RPC "invalid params" error code, returned by some execution clients instead of
/// the engine-specific invalid-payload-attributes code.
const INVALID_PARAMS_ERROR: i64 = -32602;

impl<C: EngineClient> EngineController<C> {
    /// Starts a block-building job on top of the attributes' parent block.
    ///
    /// The parent is advertised as the head of the forkchoice for the duration of the
    /// build; the tracked unsafe head is not modified until the payload lands.
    pub(crate) async fn on_build_start(&self, attributes: &AttributesWithParent) {
        let sync = self.state.read().await.sync_state;
        if sync.finalized_head().block_info.number > attributes.parent.block_info.number {
            let err = EngineControllerError::FinalizedAheadOfUnsafe {
                unsafe_number: attributes.parent.block_info.number,
                finalized_number: sync.finalized_head().block_info.number,
            };
            self.emitter.emit(Event::ResetRequested(err.to_string()));
            return;
        }
        let fc = ForkchoiceState {
            head_block_hash: attributes.parent.block_info.hash,
            safe_block_hash: sync.safe_head().block_info.hash,
            finalized_block_hash: sync.finalized_head().block_info.hash,
        };
        let timestamp = attributes.attributes.payload_attributes.timestamp;
        let version = EngineForkchoiceVersion::from_cfg(&self.cfg, timestamp);
        let build_started = Instant::now();
        let res = match self
            .client
            .fork_choice_updated(fc, Some(attributes.attributes.clone()), version)
            .await
        {
            Ok(res) => res,
            Err(err) => {
                let code = err.as_error_resp().map(|resp| resp.code);
                if code.is_some_and(|code| {
                    code == INVALID_PAYLOAD_ATTRIBUTES_ERROR as i64 || code == INVALID_PARAMS_ERROR
                }) {
                    self.emitter.emit(Event::BuildInvalid {
                        attributes: attributes.clone(),
                        reason: err.to_string(),
                    });
                } else {
                    self.emit_engine_error(&EngineControllerError::from_fcu_rpc_error(err));
                }
                return;
            }
        };
        match res.payload_status.status {
            PayloadStatusEnum::Valid => match res.payload_id {
                Some(payload_id) => {
                    debug!(
                        target: "engine",
                        %payload_id,
                        parent = %attributes.parent.block_info.hash,
                        "Started block building job"
                    );
                    self.emitter.emit(Event::BuildStarted {
                        payload_id,
                        attributes: attributes.clone(),
                        build_started,
                    });
                }
                None => {
                    self.emitter.emit(Event::TemporaryEngineError(
                        "forkchoice update was valid but returned no payload ID".to_string(),
                    ));
                }
            },
            PayloadStatusEnum::Invalid { validation_error } => {
                self.emitter.emit(Event::BuildInvalid {
                    attributes: attributes.clone(),
                    reason: validation_error,
                });
            }
            PayloadStatusEnum::Syncing => {
                self.emitter.emit(Event::TemporaryEngineError(
                    "engine is unexpectedly syncing while starting a build".to_string(),
                ));
            }
            status => {
                self.emitter.emit(Event::TemporaryEngineError(format!(
                    "unexpected payload status while starting a build: {status}"
                )));
            }
        }
    }

    /// A building job was accepted by the engine. Derived blocks carry no transaction
    /// pool content and are sealed immediately; sequencer builds wait for the block time.
    pub(crate) fn on_build_started(
        &self,
        payload_id: PayloadId,
        attributes: &AttributesWithParent,
        build_started: Instant,
    ) {
        if attributes.is_derived() {
            self.emitter.emit(Event::BuildSeal {
                payload_id,
                attributes: attributes.clone(),
                build_started,
            });
        }
    }

    /// Seals the building job into a payload by fetching it from the engine.
    pub(crate) async fn on_build_seal(
        &self,
        payload_id: PayloadId,
        attributes: &AttributesWithParent,
        build_started: Instant,
    ) {
        let sealing_started = Instant::now();
        let timestamp = attributes.attributes.payload_attributes.timestamp;
        let envelope = match self.client.get_payload(payload_id, timestamp).await {
            Ok(envelope) => Arc::new(envelope),
            Err(err) => {
                warn!(target: "engine", %payload_id, %err, "Failed to seal block building job");
                self.emitter
                    .emit(Event::TemporaryEngineError(format!("failed to seal payload: {err}")));
                return;
            }
        };
        let block_ref = match L2BlockInfo::from_payload_and_genesis(
            envelope.execution_payload.clone(),
            envelope.parent_beacon_block_root,
            &self.cfg.genesis,
        ) {
            Ok(block_ref) => block_ref,
            Err(err) => {
                let err = EngineControllerError::BlockInfoConstruction(err);
                self.emit_engine_error(&err);
                return;
            }
        };
        debug!(
            target: "engine",
            hash = %block_ref.block_info.hash,
            number = block_ref.block_info.number,
            build_duration = ?build_started.elapsed(),
            sealing_duration = ?sealing_started.elapsed(),
            "Sealed new block"
        );
        self.emitter.emit(Event::BuildSealed {
            payload_id,
            envelope,
            block_ref,
            attributes: attributes.clone(),
            build_started,
        });
    }

    /// A payload was sealed; hand it over for insertion.
    pub(crate) fn on_build_sealed(
        &self,
        envelope: &Arc<OpExecutionPayloadEnvelope>,
        block_ref: L2BlockInfo,
        attributes: &AttributesWithParent,
        build_started: Instant,
    ) {
        self.emitter.emit(Event::PayloadProcess {
            envelope: Arc::clone(envelope),
            block_ref,
            concluding: attributes.concluding,
            derived_from: attributes.derived_from,
            build_started,
        });
    }

    /// The engine rejected the attributes of a building job.
    ///
    /// Post-Holocene, derived attributes are retried with their deposit transactions
    /// only before the batch is given up on. A deposits-only block failing is not
    /// recoverable.
    pub(crate) fn on_build_invalid(&self, attributes: &AttributesWithParent, reason: &str) {
        warn!(
            target: "engine",
            parent = %attributes.parent.block_info.hash,
            reason,
            "Invalid payload attributes"
        );
        let Some(derived_from) = attributes.derived_from else {
            return;
        };
        if attributes.is_deposits_only() {
            self.emitter.emit(Event::CriticalError(
                "deposits-only block building failed".to_string(),
            ));
        } else if self.cfg.is_holocene_active(derived_from.timestamp) {
            self.emitter.emit(Event::DepositsOnlyPayloadAttributesRequest {
                parent: attributes.parent.block_info.id(),
                derived_from,
            });
        } else {
            self.emitter.emit(Event::InvalidPayloadAttributes { attributes: attributes.clone() });
        }
    }

    /// Cancels a block-building job. The engine has no cancel call; fetching the payload
    /// and discarding it releases the job.
    pub(crate) async fn on_build_cancel(&self, payload_id: PayloadId, timestamp: u64) {
        match self.client.get_payload(payload_id, timestamp).await {
            Ok(_) => info!(target: "engine", %payload_id, "Canceled block building job"),
            Err(err) => {
                warn!(target: "engine", %payload_id, %err, "Failed to cancel block building job");
            }
        }
    }
}
