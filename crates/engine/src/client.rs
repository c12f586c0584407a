//! An Engine API Client.

use std::{future::Future, sync::Arc, time::Instant};

use alloy_eips::eip1898::BlockNumberOrTag;
use alloy_network::Network;
use alloy_primitives::{B256, Bytes};
use alloy_provider::{Provider, RootProvider};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_engine::{
    ExecutionPayload, ExecutionPayloadInputV2, ForkchoiceState, ForkchoiceUpdated, JwtSecret,
    PayloadId, PayloadStatus,
};
use alloy_transport::{RpcError, TransportErrorKind, TransportResult};
use alloy_transport_http::{
    AuthLayer, AuthService, Http, HyperClient,
    hyper_util::{
        client::legacy::{Client, connect::HttpConnector},
        rt::TokioExecutor,
    },
};
use async_trait::async_trait;
use http_body_util::Full;
use kona_genesis::RollupConfig;
use kona_protocol::{BlockInfo, FromBlockError, L2BlockInfo};
use op_alloy_network::Optimism;
use op_alloy_provider::ext::engine::OpEngineApi;
use op_alloy_rpc_types_engine::{
    OpExecutionPayload, OpExecutionPayloadEnvelope, OpPayloadAttributes,
};
use thiserror::Error;
use tower::ServiceBuilder;
use url::Url;

use crate::{EngineForkchoiceVersion, EngineGetPayloadVersion, Metrics};

/// An error that occurred in the [`EngineClient`].
#[derive(Error, Debug)]
pub enum EngineClientError {
    /// An RPC error occurred.
    #[error("An RPC error occurred: {0}")]
    RpcError(#[from] RpcError<TransportErrorKind>),

    /// An error occurred while decoding a block into an [`L2BlockInfo`].
    #[error("An error occurred while decoding the block: {0}")]
    BlockInfoDecodeError(#[from] FromBlockError),
}

/// A Hyper HTTP client with a JWT authentication layer.
pub type HyperAuthClient<B = Full<Bytes>> = HyperClient<B, AuthService<Client<HttpConnector, B>>>;

/// The Engine API surface the controller needs from an execution layer client.
///
/// Version selection for `engine_newPayload` and `engine_getPayload` happens inside the
/// implementation; `engine_forkchoiceUpdated` takes the version explicitly since the
/// caller knows which timestamp the update concerns.
///
/// "Not found" lookups surface as `Ok(None)`, including the nonstandard error strings
/// geth and erigon return for the safe and finalized labels on a fresh chain.
#[async_trait]
pub trait EngineClient: Send + Sync + 'static {
    /// Returns a reference to the inner [`RollupConfig`].
    fn cfg(&self) -> &RollupConfig;

    /// Submits the payload to the execution layer via `engine_newPayload`.
    async fn new_payload(
        &self,
        payload: OpExecutionPayload,
        parent_beacon_block_root: Option<B256>,
    ) -> TransportResult<PayloadStatus>;

    /// Updates the execution layer forkchoice via `engine_forkchoiceUpdated`, optionally
    /// starting a block-building job with the given attributes.
    async fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<OpPayloadAttributes>,
        version: EngineForkchoiceVersion,
    ) -> TransportResult<ForkchoiceUpdated>;

    /// Fetches the payload of a building job via `engine_getPayload`. The timestamp
    /// selects the method version.
    async fn get_payload(
        &self,
        payload_id: PayloadId,
        timestamp: u64,
    ) -> TransportResult<OpExecutionPayloadEnvelope>;

    /// Fetches the [`L2BlockInfo`] for the given label.
    async fn l2_block_info_by_label(
        &self,
        label: BlockNumberOrTag,
    ) -> Result<Option<L2BlockInfo>, EngineClientError>;

    /// Fetches the [`L2BlockInfo`] for the given block hash.
    async fn l2_block_info_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<L2BlockInfo>, EngineClientError>;

    /// Fetches the L1 [`BlockInfo`] for the given block hash.
    async fn l1_block_info_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<BlockInfo>, EngineClientError>;
}

/// An Engine API client that provides authenticated HTTP communication with an execution
/// layer.
///
/// The [`HttpEngineClient`] handles JWT authentication and manages connections to both the
/// L1 chain and the L2 execution layer. It automatically selects the appropriate Engine API
/// version based on the rollup configuration and block timestamps.
#[derive(Clone, Debug)]
pub struct HttpEngineClient {
    /// The L2 engine provider for Engine API calls.
    engine: RootProvider<Optimism>,
    /// The L1 chain provider for reading L1 data.
    l1_provider: RootProvider,
    /// The [`RollupConfig`] for determining Engine API versions based on hardfork
    /// activations.
    cfg: Arc<RollupConfig>,
}

impl HttpEngineClient {
    /// Creates a new JWT-authenticated RPC provider for the given address.
    pub fn rpc_client<N: Network>(addr: Url, jwt: JwtSecret) -> RootProvider<N> {
        let hyper_client = Client::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
        let auth_layer = AuthLayer::new(jwt);
        let service = ServiceBuilder::new().layer(auth_layer).service(hyper_client);
        let layer_transport = HyperClient::with_service(service);
        let http_hyper = Http::with_client(layer_transport, addr);
        let rpc_client = RpcClient::new(http_hyper, false);
        RootProvider::<N>::new(rpc_client)
    }
}

/// The builder for the [`HttpEngineClient`].
#[derive(Debug, Clone)]
pub struct EngineClientBuilder {
    /// The L2 Engine API endpoint URL.
    pub l2: Url,
    /// The L2 JWT secret.
    pub l2_jwt: JwtSecret,
    /// The L1 RPC URL.
    pub l1_rpc: Url,
    /// The [`RollupConfig`] for determining Engine API versions based on hardfork
    /// activations.
    pub cfg: Arc<RollupConfig>,
}

impl EngineClientBuilder {
    /// Creates a new [`HttpEngineClient`] with authenticated HTTP connections.
    ///
    /// Sets up a JWT-authenticated connection to the Engine API endpoint along with an
    /// unauthenticated connection to the L1 chain.
    pub fn build(self) -> HttpEngineClient {
        let engine = HttpEngineClient::rpc_client::<Optimism>(self.l2, self.l2_jwt);
        let l1_provider = RootProvider::new_http(self.l1_rpc);

        HttpEngineClient { engine, l1_provider, cfg: self.cfg }
    }
}

impl HttpEngineClient {
    /// Fetches an L2 block and handles the nonstandard errors geth and erigon return for
    /// the safe and finalized labels when nothing is marked as safe or finalized yet.
    async fn l2_block_compat(
        &self,
        label: BlockNumberOrTag,
    ) -> TransportResult<Option<<Optimism as Network>::BlockResponse>> {
        match self.engine.get_block_by_number(label).full().await {
            Err(e) => {
                let err_str = e.to_string();
                if err_str.contains("block not found") || err_str.contains("Unknown block") {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
            r => r,
        }
    }
}

#[async_trait]
impl EngineClient for HttpEngineClient {
    fn cfg(&self) -> &RollupConfig {
        self.cfg.as_ref()
    }

    async fn new_payload(
        &self,
        payload: OpExecutionPayload,
        parent_beacon_block_root: Option<B256>,
    ) -> TransportResult<PayloadStatus> {
        let parent_beacon_block_root = parent_beacon_block_root.unwrap_or_default();
        let call = async {
            match payload {
                OpExecutionPayload::V1(payload) => {
                    let payload_input = ExecutionPayloadInputV2 {
                        execution_payload: payload,
                        withdrawals: None,
                    };
                    OpEngineApi::<Optimism, Http<HyperAuthClient>>::new_payload_v2(
                        &self.engine,
                        payload_input,
                    )
                    .await
                }
                OpExecutionPayload::V2(payload) => {
                    let payload_input = ExecutionPayloadInputV2 {
                        execution_payload: payload.payload_inner,
                        withdrawals: Some(payload.withdrawals),
                    };
                    OpEngineApi::<Optimism, Http<HyperAuthClient>>::new_payload_v2(
                        &self.engine,
                        payload_input,
                    )
                    .await
                }
                OpExecutionPayload::V3(payload) => {
                    OpEngineApi::<Optimism, Http<HyperAuthClient>>::new_payload_v3(
                        &self.engine,
                        payload,
                        parent_beacon_block_root,
                    )
                    .await
                }
                OpExecutionPayload::V4(payload) => {
                    OpEngineApi::<Optimism, Http<HyperAuthClient>>::new_payload_v4(
                        &self.engine,
                        payload,
                        parent_beacon_block_root,
                    )
                    .await
                }
            }
        };

        record_call_time(call, Metrics::NEW_PAYLOAD_METHOD).await
    }

    async fn fork_choice_updated(
        &self,
        state: ForkchoiceState,
        attributes: Option<OpPayloadAttributes>,
        version: EngineForkchoiceVersion,
    ) -> TransportResult<ForkchoiceUpdated> {
        let call = async {
            match version {
                EngineForkchoiceVersion::V3 => {
                    OpEngineApi::<Optimism, Http<HyperAuthClient>>::fork_choice_updated_v3(
                        &self.engine,
                        state,
                        attributes,
                    )
                    .await
                }
                EngineForkchoiceVersion::V2 => {
                    OpEngineApi::<Optimism, Http<HyperAuthClient>>::fork_choice_updated_v2(
                        &self.engine,
                        state,
                        attributes,
                    )
                    .await
                }
            }
        };

        record_call_time(call, Metrics::FORKCHOICE_UPDATE_METHOD).await
    }

    async fn get_payload(
        &self,
        payload_id: PayloadId,
        timestamp: u64,
    ) -> TransportResult<OpExecutionPayloadEnvelope> {
        let version = EngineGetPayloadVersion::from_cfg(&self.cfg, timestamp);
        let call = async {
            match version {
                EngineGetPayloadVersion::V4 => {
                    let payload = OpEngineApi::<Optimism, Http<HyperAuthClient>>::get_payload_v4(
                        &self.engine,
                        payload_id,
                    )
                    .await?;
                    Ok(OpExecutionPayloadEnvelope {
                        parent_beacon_block_root: Some(payload.parent_beacon_block_root),
                        execution_payload: OpExecutionPayload::V4(payload.execution_payload),
                    })
                }
                EngineGetPayloadVersion::V3 => {
                    let payload = OpEngineApi::<Optimism, Http<HyperAuthClient>>::get_payload_v3(
                        &self.engine,
                        payload_id,
                    )
                    .await?;
                    Ok(OpExecutionPayloadEnvelope {
                        parent_beacon_block_root: Some(payload.parent_beacon_block_root),
                        execution_payload: OpExecutionPayload::V3(payload.execution_payload),
                    })
                }
                EngineGetPayloadVersion::V2 => {
                    let payload = OpEngineApi::<Optimism, Http<HyperAuthClient>>::get_payload_v2(
                        &self.engine,
                        payload_id,
                    )
                    .await?;
                    Ok(OpExecutionPayloadEnvelope {
                        parent_beacon_block_root: None,
                        execution_payload: match payload.execution_payload.into_payload() {
                            ExecutionPayload::V1(payload) => OpExecutionPayload::V1(payload),
                            ExecutionPayload::V2(payload) => OpExecutionPayload::V2(payload),
                            _ => unreachable!("the response should be a V1 or V2 payload"),
                        },
                    })
                }
            }
        };

        record_call_time(call, Metrics::GET_PAYLOAD_METHOD).await
    }

    async fn l2_block_info_by_label(
        &self,
        label: BlockNumberOrTag,
    ) -> Result<Option<L2BlockInfo>, EngineClientError> {
        let Some(block) = self.l2_block_compat(label).await? else {
            return Ok(None);
        };
        let block = block.into_consensus().map_transactions(|tx| tx.inner.inner.into_inner());
        Ok(Some(L2BlockInfo::from_block_and_genesis(&block, &self.cfg.genesis)?))
    }

    async fn l2_block_info_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<L2BlockInfo>, EngineClientError> {
        let Some(block) = self.engine.get_block_by_hash(hash).full().await? else {
            return Ok(None);
        };
        let block = block.into_consensus().map_transactions(|tx| tx.inner.inner.into_inner());
        Ok(Some(L2BlockInfo::from_block_and_genesis(&block, &self.cfg.genesis)?))
    }

    async fn l1_block_info_by_hash(
        &self,
        hash: B256,
    ) -> Result<Option<BlockInfo>, EngineClientError> {
        let block = self.l1_provider.get_block_by_hash(hash).await?;
        Ok(block.map(|b| {
            BlockInfo::new(b.header.hash, b.header.number, b.header.parent_hash, b.header.timestamp)
        }))
    }
}

/// Wrapper to record the time taken for a call to the engine API and log the result as a
/// metric.
async fn record_call_time<T, Err>(
    f: impl Future<Output = Result<T, Err>>,
    metric_label: &'static str,
) -> Result<T, Err> {
    // Await on the future and track its duration.
    let start = Instant::now();
    let result = f.await?;

    // Record the call duration.
    let duration = start.elapsed();
    metrics::histogram!(Metrics::ENGINE_METHOD_REQUEST_DURATION, "method" => metric_label)
        .record(duration.as_secs_f64());

    Ok(result)
}
