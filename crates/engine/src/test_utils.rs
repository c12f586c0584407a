//! Test utilities for the engine crate.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use alloy_eips::eip1898::BlockNumberOrTag;
use alloy_json_rpc::ErrorPayload;
use alloy_primitives::{B256, Bytes, U256};
use alloy_rpc_types_engine::{
    ExecutionPayloadV1, ForkchoiceState, ForkchoiceUpdated, INVALID_FORK_CHOICE_STATE_ERROR,
    PayloadId, PayloadStatus, PayloadStatusEnum,
};
use alloy_transport::{RpcError, TransportErrorKind, TransportResult};
use async_trait::async_trait;
use kona_genesis::RollupConfig;
use kona_protocol::{BlockInfo, L2BlockInfo};
use op_alloy_rpc_types_engine::{
    OpExecutionPayload, OpExecutionPayloadEnvelope, OpPayloadAttributes,
};

use crate::{EngineClient, EngineClientError, Event, EventEmitter};

/// Returns a deterministic block hash for the given block number.
pub fn block_hash(number: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[0] = 0xff;
    bytes[24..].copy_from_slice(&number.to_be_bytes());
    B256::new(bytes)
}

/// Returns an [`L2BlockInfo`] at the given height, chained via [`block_hash`].
pub fn l2_block_at(number: u64) -> L2BlockInfo {
    L2BlockInfo {
        block_info: BlockInfo {
            hash: block_hash(number),
            number,
            parent_hash: if number == 0 { B256::ZERO } else { block_hash(number - 1) },
            timestamp: number,
        },
        l1_origin: Default::default(),
        seq_num: 0,
    }
}

/// Returns a V1 payload envelope matching [`l2_block_at`] for the same height.
pub fn payload_envelope_at(number: u64) -> Arc<OpExecutionPayloadEnvelope> {
    payload_envelope(number, Vec::new())
}

/// Returns a V1 payload envelope at the given height carrying the given transactions.
pub fn payload_envelope(number: u64, transactions: Vec<Bytes>) -> Arc<OpExecutionPayloadEnvelope> {
    Arc::new(OpExecutionPayloadEnvelope {
        parent_beacon_block_root: None,
        execution_payload: OpExecutionPayload::V1(ExecutionPayloadV1 {
            parent_hash: if number == 0 { B256::ZERO } else { block_hash(number - 1) },
            fee_recipient: Default::default(),
            state_root: B256::ZERO,
            receipts_root: B256::ZERO,
            logs_bloom: Default::default(),
            prev_randao: B256::ZERO,
            block_number: number,
            gas_limit: 30_000_000,
            gas_used: 0,
            timestamp: number,
            extra_data: Bytes::new(),
            base_fee_per_gas: U256::from(7),
            block_hash: block_hash(number),
            transactions,
        }),
    })
}

/// Returns the error response the engine sends for an inconsistent forkchoice state.
pub fn invalid_forkchoice_state_error() -> RpcError<TransportErrorKind> {
    RpcError::ErrorResp(ErrorPayload {
        code: INVALID_FORK_CHOICE_STATE_ERROR as i64,
        message: "Invalid forkchoice state".into(),
        data: None,
    })
}

/// Returns a transport-level error.
pub fn transport_error() -> RpcError<TransportErrorKind> {
    TransportErrorKind::custom_str("connection refused")
}

/// An [`EventEmitter`] that records every emitted event.
#[derive(Debug, Default)]
pub struct MockEmitter {
    events: Mutex<Vec<Event>>,
}

impl MockEmitter {
    /// Returns a copy of the recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Drains and returns the recorded events.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventEmitter for MockEmitter {
    fn emit(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

/// A scripted [`EngineClient`].
///
/// Responses are popped from per-method queues; when a queue is empty the method
/// defaults to a `VALID` status (or `Ok(None)` for block lookups against an empty map).
#[derive(Debug)]
pub struct MockEngineClient {
    /// The rollup config returned by [`EngineClient::cfg`].
    pub cfg: Arc<RollupConfig>,
    /// Queued `engine_newPayload` responses.
    pub new_payload_responses: Mutex<VecDeque<TransportResult<PayloadStatus>>>,
    /// Queued `engine_forkchoiceUpdated` responses.
    pub fcu_responses: Mutex<VecDeque<TransportResult<ForkchoiceUpdated>>>,
    /// Queued `engine_getPayload` responses.
    pub get_payload_responses: Mutex<VecDeque<TransportResult<OpExecutionPayloadEnvelope>>>,
    /// L2 blocks served by label.
    pub blocks_by_label: Mutex<HashMap<BlockNumberOrTag, L2BlockInfo>>,
    /// L2 blocks served by hash.
    pub l2_blocks_by_hash: Mutex<HashMap<B256, L2BlockInfo>>,
    /// L1 blocks served by hash.
    pub l1_blocks_by_hash: Mutex<HashMap<B256, BlockInfo>>,
    /// Recorded `engine_forkchoiceUpdated` calls.
    pub fcu_calls: Mutex<Vec<(ForkchoiceState, Option<OpPayloadAttributes>)>>,
    /// Recorded `engine_newPayload` calls.
    pub new_payload_calls: Mutex<Vec<OpExecutionPayload>>,
}

impl Default for MockEngineClient {
    fn default() -> Self {
        Self {
            cfg: Arc::new(RollupConfig::default()),
            new_payload_responses: Mutex::new(VecDeque::new()),
            fcu_responses: Mutex::new(VecDeque::new()),
            get_payload_responses: Mutex::new(VecDeque::new()),
            blocks_by_label: Mutex::new(HashMap::new()),
            l2_blocks_by_hash: Mutex::new(HashMap::new()),
            l1_blocks_by_hash: Mutex::new(HashMap::new()),
            fcu_calls: Mutex::new(Vec::new()),
            new_payload_calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockEngineClient {
    /// Queues an `engine_newPayload` response.
    pub fn push_new_payload_response(&self, response: TransportResult<PayloadStatus>) {
        self.new_payload_responses.lock().unwrap().push_back(response);
    }

    /// Queues an `engine_forkchoiceUpdated` response.
    pub fn push_fcu_response(&self, response: TransportResult<ForkchoiceUpdated>) {
        self.fcu_responses.lock().unwrap().push_back(response);
    }

    /// Queues an `engine_getPayload` response.
    pub fn push_get_payload_response(
        &self,
        response: TransportResult<OpExecutionPayloadEnvelope>,
    ) {
        self.get_payload_responses.lock().unwrap().push_back(response);
    }

    /// Serves the given L2 block for the given label.
    pub fn insert_block_by_label(&self, label: BlockNumberOrTag, block: L2BlockInfo) {
        self.blocks_by_label.lock().unwrap().insert(label, block);
    }

    /// Serves the given L2 block for its hash.
    pub fn insert_l2_block_by_hash(&self, block: L2BlockInfo) {
        self.l2_blocks_by_hash.lock().unwrap().insert(block.block_info.hash, block);
    }

    /// Serves the given L1 block for its hash.
    pub fn insert_l1_block_by_hash(&self, block: BlockInfo) {
        self.l1_blocks_by_hash.lock().unwrap().insert(block.hash, block);
    }

    /// Number of `engine_forkchoiceUpdated` calls made.
    pub fn fcu_call_count(&self) -> usize {
        self.fcu_calls.lock().unwrap().len()
    }

    /// Number of `engine_newPayload` calls made.
    pub fn new_payload_call_count(&self) -> usize {
        self.new_payload_calls.lock().unwrap().len()
    }

    /// The last recorded `engine_forkchoiceUpdated` call.
    pub fn last_fcu_call(&self) -> Option<(ForkchoiceState, Option<OpPayloadAttributes>)> {
        self.fcu_calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl EngineClient for MockEngineClient {
    fn cfg(&self) -> &RollupConfig {
        self.cfg.as_ref()
    }

    async fn new_payload(
        &self,
        payload: OpExecutionPayload,
        _parent_beacon_block_root: Option<B256>,
    ) -> TransportResult<PayloadStatus> {
        self.new_payload_calls.lock().unwrap().push(payload);
        self.new_payload_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(PayloadStatus::from_status(PayloadStatusEnum::Valid)))
    }

    async fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<OpPayloadAttributes>,
        _version: crate::EngineForkchoiceVersion,
    ) -> TransportResult<ForkchoiceUpdated> {
        self.fcu_calls.lock().unwrap().push((state, attributes));
        self.fcu_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(ForkchoiceUpdated::from_status(PayloadStatusEnum::Valid)))
    }

    async fn get_payload(
        &self,
        _payload_id: PayloadId,
        _timestamp: u64,
    ) -> TransportResult<OpExecutionPayloadEnvelope> {
        self.get_payload_responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(transport_error()))
    }

    async fn l2_block_info_by_label(
        &self,
        label: BlockNumberOrTag,
    ) -> Result<Option<L2BlockInfo>, EngineClientError> {
        Ok(self.blocks_by_label.lock().unwrap().get(&label).copied())
    }

    async fn l2_block_info_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<L2BlockInfo>, EngineClientError> {
        Ok(self.l2_blocks_by_hash.lock().unwrap().get(&hash).copied())
    }

    async fn l1_block_info_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<BlockInfo>, EngineClientError> {
        Ok(self.l1_blocks_by_hash.lock().unwrap().get(&hash).copied())
    }
}
