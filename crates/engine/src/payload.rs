//! Payload insertion handlers of the [`EngineController`].

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use alloy_eips::BlockNumHash;
use alloy_rpc_types_engine::PayloadStatusEnum;
use kona_protocol::{BlockInfo, L2BlockInfo};
use op_alloy_rpc_types_engine::OpExecutionPayloadEnvelope;

use crate::{EngineClient, EngineController, EngineControllerError, Event};

/// Bound on a single `engine_newPayload` call. Payload processing runs on the event loop
/// and a hung engine must not stall it indefinitely.
const PAYLOAD_PROCESS_TIMEOUT: Duration = Duration::from_secs(10);

impl<C: EngineClient> EngineController<C> {
    /// Submits a sealed payload to the execution layer.
    pub(crate) async fn on_payload_process(
        &self,
        envelope: &Arc<OpExecutionPayloadEnvelope>,
        block_ref: L2BlockInfo,
        concluding: bool,
        derived_from: Option<BlockInfo>,
        build_started: Instant,
    ) {
        let call = self
            .client
            .new_payload(envelope.execution_payload.clone(), envelope.parent_beacon_block_root);
        let status = match tokio::time::timeout(PAYLOAD_PROCESS_TIMEOUT, call).await {
            Err(_) => {
                self.emitter.emit(Event::TemporaryEngineError(format!(
                    "payload processing timed out after {PAYLOAD_PROCESS_TIMEOUT:?}"
                )));
                return;
            }
            Ok(Err(err)) => {
                self.emit_engine_error(&EngineControllerError::NewPayloadFailed(err));
                return;
            }
            Ok(Ok(status)) => status,
        };
        match status.status {
            PayloadStatusEnum::Valid => {
                debug!(
                    target: "engine",
                    hash = %block_ref.block_info.hash,
                    number = block_ref.block_info.number,
                    total_duration = ?build_started.elapsed(),
                    "Processed new block"
                );
                self.emitter.emit(Event::PayloadSuccess {
                    envelope: Arc::clone(envelope),
                    block_ref,
                    concluding,
                    derived_from,
                });
            }
            PayloadStatusEnum::Invalid { validation_error } => {
                warn!(
                    target: "engine",
                    hash = %block_ref.block_info.hash,
                    number = block_ref.block_info.number,
                    %validation_error,
                    "Engine rejected processed payload"
                );
                if let Some(derived_from) = derived_from {
                    // Holocene activation is judged by the L1 origin the batch was
                    // derived from, not the L2 block timestamp.
                    if self.cfg.is_holocene_active(derived_from.timestamp) {
                        // Post-Holocene, retry the batch with its deposits only instead of
                        // dropping it.
                        self.emitter.emit(Event::DepositsOnlyPayloadAttributesRequest {
                            parent: BlockNumHash {
                                hash: envelope.execution_payload.parent_hash(),
                                number: block_ref.block_info.number.saturating_sub(1),
                            },
                            derived_from,
                        });
                        return;
                    }
                }
                self.emitter.emit(Event::PayloadInvalid { envelope: Arc::clone(envelope) });
            }
            status => {
                self.emitter.emit(Event::TemporaryEngineError(format!(
                    "unexpected payload status while processing payload: {status}"
                )));
            }
        }
    }

    /// A processed payload was accepted; promote it and push the new forkchoice.
    pub(crate) async fn on_payload_success(
        &self,
        block_ref: L2BlockInfo,
        concluding: bool,
        derived_from: Option<BlockInfo>,
    ) {
        let mut st = self.state.write().await;
        self.try_update_unsafe_locked(&mut st, block_ref);
        if let Some(source) = derived_from {
            self.try_update_pending_safe_locked(&mut st, block_ref, concluding);
            self.try_update_local_safe_locked(&mut st, block_ref, concluding, source);
        }
        if let Err(err) = self.try_update_engine_locked(&mut st).await {
            warn!(target: "engine", %err, "Failed to update forkchoice after successful payload");
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_rpc_types_engine::PayloadStatus;
    use kona_genesis::{HardForkConfig, RollupConfig};

    use super::*;
    use crate::{
        SyncConfig, SyncMode,
        test_utils::{MockEmitter, MockEngineClient, l2_block_at, payload_envelope_at},
    };

    fn holocene_controller(
        client: &Arc<MockEngineClient>,
        emitter: &Arc<MockEmitter>,
        holocene_time: u64,
    ) -> EngineController<MockEngineClient> {
        let cfg = RollupConfig {
            hardforks: HardForkConfig { holocene_time: Some(holocene_time), ..Default::default() },
            ..Default::default()
        };
        EngineController::new(
            client.clone(),
            Arc::new(cfg),
            SyncConfig {
                sync_mode: SyncMode::ConsensusLayer,
                supports_post_finalization_el_sync: false,
            },
            emitter.clone(),
        )
    }

    fn invalid_status() -> PayloadStatus {
        PayloadStatus::from_status(PayloadStatusEnum::Invalid {
            validation_error: "bad state root".to_string(),
        })
    }

    fn origin_at(timestamp: u64) -> BlockInfo {
        BlockInfo { timestamp, ..Default::default() }
    }

    #[tokio::test]
    async fn test_deposits_only_retry_follows_derivation_origin_time() {
        let client = Arc::new(MockEngineClient::default());
        client.push_new_payload_response(Ok(invalid_status()));
        let emitter = Arc::new(MockEmitter::default());
        let controller = holocene_controller(&client, &emitter, 100);

        // The L2 block predates activation, but its L1 origin does not.
        let envelope = payload_envelope_at(2);
        controller
            .on_payload_process(&envelope, l2_block_at(2), true, Some(origin_at(150)), Instant::now())
            .await;

        assert!(matches!(
            emitter.take().as_slice(),
            [Event::DepositsOnlyPayloadAttributesRequest { .. }]
        ));
    }

    #[tokio::test]
    async fn test_invalid_payload_with_pre_activation_origin_is_dropped() {
        let client = Arc::new(MockEngineClient::default());
        client.push_new_payload_response(Ok(invalid_status()));
        let emitter = Arc::new(MockEmitter::default());
        let controller = holocene_controller(&client, &emitter, 100);

        // The L2 block is past activation, but its L1 origin is not.
        let envelope = payload_envelope_at(150);
        controller
            .on_payload_process(&envelope, l2_block_at(150), true, Some(origin_at(50)), Instant::now())
            .await;

        assert!(matches!(emitter.take().as_slice(), [Event::PayloadInvalid { .. }]));
    }
}
