//! Sync-start search and forced engine resets.
//!
//! After a restart, or whenever the tracked forkchoice turns out to be inconsistent
//! with the execution layer, the node has to re-derive a forkchoice it can trust:
//! walk back from the execution layer's unsafe head until a block whose L1 origin is
//! canonical is found, and keep walking until a block old enough to be beyond any
//! sequencing-window ambiguity serves as the safe head.

use std::sync::Arc;

use alloy_eips::eip1898::BlockNumberOrTag;
use alloy_primitives::B256;
use async_trait::async_trait;
use kona_genesis::RollupConfig;
use kona_protocol::L2BlockInfo;
use thiserror::Error;

use crate::{
    EngineClient, EngineClientError, EngineController, Event, EventEmitter, EventHandler,
};

/// An error that occurred during the sync-start search.
#[derive(Error, Debug)]
pub enum SyncStartError {
    /// A lookup against the execution layer or the L1 chain failed.
    #[error(transparent)]
    Client(#[from] EngineClientError),

    /// A head required to seed the search is not known to the execution layer.
    #[error("no block found for {0} head")]
    MissingHead(&'static str),

    /// A parent block in the walk-back is not known to the execution layer.
    #[error("missing L2 block {0} while walking back the chain")]
    MissingL2Block(B256),

    /// The execution layer's chain does not share the configured genesis.
    #[error("wrong chain, block at genesis height {number} has hash {got}, expected {expected}")]
    InvalidGenesis {
        /// The genesis block number.
        number: u64,
        /// The hash found on the execution layer's chain.
        got: B256,
        /// The configured genesis hash.
        expected: B256,
    },

    /// No canonical L1 origin was found above the finalized block; recovering would
    /// require reorging out finalized data.
    #[error("cannot reorg out finalized block {finalized}, walked back to block {number} without finding a canonical L1 origin")]
    ReorgBeyondFinalized {
        /// The block number the walk-back reached.
        number: u64,
        /// The finalized block number.
        finalized: u64,
    },
}

/// The forkchoice triple tracked on behalf of the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct L2ForkchoiceState {
    /// The unsafe head.
    pub un_safe: L2BlockInfo,
    /// The safe head.
    pub safe: L2BlockInfo,
    /// The finalized head.
    pub finalized: L2BlockInfo,
}

impl std::fmt::Display for L2ForkchoiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unsafe: {} (#{}), safe: {} (#{}), finalized: {} (#{})",
            self.un_safe.block_info.hash,
            self.un_safe.block_info.number,
            self.safe.block_info.hash,
            self.safe.block_info.number,
            self.finalized.block_info.hash,
            self.finalized.block_info.number,
        )
    }
}

impl L2ForkchoiceState {
    /// Fetches the current forkchoice state of the execution layer.
    ///
    /// - The finalized block may not exist yet, in which case the genesis block stands in
    ///   for it.
    /// - The safe block may not exist yet, in which case the finalized block stands in
    ///   for it.
    pub async fn current<C: EngineClient>(
        client: &C,
        cfg: &RollupConfig,
    ) -> Result<Self, SyncStartError> {
        let finalized = match client.l2_block_info_by_label(BlockNumberOrTag::Finalized).await? {
            Some(finalized) => finalized,
            None => client
                .l2_block_info_by_label(BlockNumberOrTag::Number(cfg.genesis.l2.number))
                .await?
                .ok_or(SyncStartError::MissingHead("finalized"))?,
        };
        let safe = match client.l2_block_info_by_label(BlockNumberOrTag::Safe).await? {
            Some(safe) => safe,
            None => finalized,
        };
        let un_safe = client
            .l2_block_info_by_label(BlockNumberOrTag::Latest)
            .await?
            .ok_or(SyncStartError::MissingHead("unsafe"))?;
        Ok(Self { un_safe, safe, finalized })
    }
}

/// Searches for a forkchoice state the node can safely sync from.
///
/// The unsafe head becomes the highest block (starting from the execution layer's tip)
/// whose L1 origin is canonical. The safe head walks further back until its L1 origin is
/// more than a sequencing window older than the unsafe head's origin, so no batch
/// published within the window can contradict it. The finalized head is taken as-is.
pub async fn find_starting_forkchoice<C: EngineClient>(
    client: &C,
    cfg: &RollupConfig,
) -> Result<L2ForkchoiceState, SyncStartError> {
    let current = L2ForkchoiceState::current(client, cfg).await?;
    info!(target: "sync_start", %current, "Loaded current L2 heads");

    // Walk back from the tip until a block with a canonical L1 origin is found.
    let mut cursor = current.un_safe;
    let un_safe = loop {
        let canonical = client
            .l1_block_info_by_hash(cursor.l1_origin.hash)
            .await?
            .is_some_and(|l1_block| l1_block.number == cursor.l1_origin.number);
        if canonical {
            break cursor;
        }
        if cursor.block_info.number <= cfg.genesis.l2.number {
            if cursor.block_info.hash != cfg.genesis.l2.hash {
                return Err(SyncStartError::InvalidGenesis {
                    number: cursor.block_info.number,
                    got: cursor.block_info.hash,
                    expected: cfg.genesis.l2.hash,
                });
            }
            // The L1 origin of genesis not being known means the L1 node is far behind;
            // syncing from genesis is still correct.
            break cursor;
        }
        if cursor.block_info.number <= current.finalized.block_info.number {
            return Err(SyncStartError::ReorgBeyondFinalized {
                number: cursor.block_info.number,
                finalized: current.finalized.block_info.number,
            });
        }
        debug!(
            target: "sync_start",
            number = cursor.block_info.number,
            l1_origin = %cursor.l1_origin.hash,
            "L1 origin is not canonical, walking back"
        );
        cursor = client
            .l2_block_info_by_hash(cursor.block_info.parent_hash)
            .await?
            .ok_or(SyncStartError::MissingL2Block(cursor.block_info.parent_hash))?;
    };

    // Walk further back to a block that is certainly derived from canonical L1 data.
    let mut safe = un_safe;
    let safe = loop {
        if safe.block_info.number <= current.finalized.block_info.number {
            break current.finalized;
        }
        if safe.block_info.number <= cfg.genesis.l2.number {
            break safe;
        }
        if safe.l1_origin.number + cfg.seq_window_size < un_safe.l1_origin.number {
            break safe;
        }
        safe = client
            .l2_block_info_by_hash(safe.block_info.parent_hash)
            .await?
            .ok_or(SyncStartError::MissingL2Block(safe.block_info.parent_hash))?;
    };

    let state = L2ForkchoiceState { un_safe, safe, finalized: current.finalized };
    info!(target: "sync_start", %state, "Found starting L2 forkchoice state");
    Ok(state)
}

/// Derives a trustworthy forkchoice state on demand and forces the engine onto it.
///
/// Listens for reset-engine requests; search failures are reported as temporary errors
/// so the requester can retry.
pub struct EngineResetDeriver<C: EngineClient> {
    client: Arc<C>,
    cfg: Arc<RollupConfig>,
    controller: Arc<EngineController<C>>,
    emitter: Arc<dyn EventEmitter>,
}

impl<C: EngineClient> std::fmt::Debug for EngineResetDeriver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineResetDeriver").finish_non_exhaustive()
    }
}

impl<C: EngineClient> EngineResetDeriver<C> {
    /// Creates a new [`EngineResetDeriver`].
    pub fn new(
        client: Arc<C>,
        cfg: Arc<RollupConfig>,
        controller: Arc<EngineController<C>>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self { client, cfg, controller, emitter }
    }
}

#[async_trait]
impl<C: EngineClient> EventHandler for EngineResetDeriver<C> {
    async fn on_event(&self, event: &Event) -> bool {
        if !matches!(event, Event::ResetEngineRequest) {
            return false;
        }
        match find_starting_forkchoice(self.client.as_ref(), &self.cfg).await {
            Ok(state) => {
                self.controller
                    .force_reset(
                        state.un_safe,
                        state.un_safe,
                        state.safe,
                        state.safe,
                        state.finalized,
                    )
                    .await;
            }
            Err(err) => {
                warn!(target: "sync_start", %err, "Failed to find starting forkchoice state");
                self.emitter.emit(Event::TemporaryEngineError(format!(
                    "failed to find starting forkchoice state: {err}"
                )));
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use kona_protocol::BlockInfo;

    use super::*;
    use crate::{
        SyncConfig, SyncMode,
        test_utils::{MockEmitter, MockEngineClient, block_hash, l2_block_at},
    };

    fn block_with_origin(number: u64, origin: BlockInfo) -> L2BlockInfo {
        let mut block = l2_block_at(number);
        block.l1_origin = origin.id();
        block
    }

    fn l1_block_at(number: u64) -> BlockInfo {
        BlockInfo {
            hash: block_hash(number),
            number,
            parent_hash: block_hash(number.saturating_sub(1)),
            timestamp: number,
        }
    }

    #[tokio::test]
    async fn test_current_falls_back_to_genesis_and_finalized() {
        let client = MockEngineClient::default();
        client.insert_block_by_label(BlockNumberOrTag::Number(0), l2_block_at(0));
        client.insert_block_by_label(BlockNumberOrTag::Latest, l2_block_at(5));

        let state = L2ForkchoiceState::current(&client, client.cfg()).await.unwrap();
        assert_eq!(state.finalized, l2_block_at(0));
        assert_eq!(state.safe, l2_block_at(0));
        assert_eq!(state.un_safe, l2_block_at(5));
    }

    #[tokio::test]
    async fn test_find_walks_back_to_canonical_origin() {
        let client = MockEngineClient::default();
        client.insert_block_by_label(BlockNumberOrTag::Number(0), l2_block_at(0));
        // Block 5 was built on an L1 origin that got reorged out; blocks 4 and below sit
        // on canonical origins.
        client.insert_block_by_label(
            BlockNumberOrTag::Latest,
            block_with_origin(5, l1_block_at(105)),
        );
        client.insert_l2_block_by_hash(block_with_origin(4, l1_block_at(104)));
        client.insert_l2_block_by_hash(block_with_origin(3, l1_block_at(100)));
        client.insert_l1_block_by_hash(l1_block_at(104));
        client.insert_l1_block_by_hash(l1_block_at(100));

        let cfg = RollupConfig { seq_window_size: 2, ..Default::default() };
        let state = find_starting_forkchoice(&client, &cfg).await.unwrap();
        assert_eq!(state.un_safe, block_with_origin(4, l1_block_at(104)));
        // Block 3's origin is more than a sequencing window behind block 4's.
        assert_eq!(state.safe, block_with_origin(3, l1_block_at(100)));
        assert_eq!(state.finalized, l2_block_at(0));
    }

    #[tokio::test]
    async fn test_find_refuses_to_reorg_out_finalized_blocks() {
        let client = MockEngineClient::default();
        client.insert_block_by_label(BlockNumberOrTag::Finalized, l2_block_at(3));
        client.insert_block_by_label(
            BlockNumberOrTag::Latest,
            block_with_origin(5, l1_block_at(105)),
        );
        client.insert_l2_block_by_hash(block_with_origin(4, l1_block_at(104)));
        client.insert_l2_block_by_hash(block_with_origin(3, l1_block_at(103)));

        let err = find_starting_forkchoice(&client, client.cfg()).await.unwrap_err();
        assert!(matches!(err, SyncStartError::ReorgBeyondFinalized { finalized: 3, .. }));
    }

    #[tokio::test]
    async fn test_reset_deriver_forces_controller_onto_found_state() {
        let client = Arc::new(MockEngineClient::default());
        let origin = l1_block_at(100);
        client.insert_l1_block_by_hash(origin);
        let tip = block_with_origin(2, origin);
        let finalized = block_with_origin(1, origin);
        client.insert_block_by_label(BlockNumberOrTag::Latest, tip);
        client.insert_block_by_label(BlockNumberOrTag::Finalized, finalized);
        client.insert_l2_block_by_hash(finalized);

        let emitter = Arc::new(MockEmitter::default());
        let cfg = Arc::new(RollupConfig::default());
        let controller = Arc::new(EngineController::new(
            client.clone(),
            cfg.clone(),
            SyncConfig {
                sync_mode: SyncMode::ConsensusLayer,
                supports_post_finalization_el_sync: false,
            },
            emitter.clone(),
        ));
        let deriver =
            EngineResetDeriver::new(client.clone(), cfg, controller.clone(), emitter.clone());

        assert!(deriver.on_event(&Event::ResetEngineRequest).await);

        assert_eq!(controller.unsafe_head().await, tip);
        assert_eq!(controller.cross_unsafe_head().await, tip);
        assert_eq!(controller.safe_head().await, finalized);
        assert_eq!(controller.local_safe_head().await, finalized);
        assert_eq!(controller.finalized_head().await, finalized);
        assert!(
            emitter.events().iter().any(|e| matches!(e, Event::EngineResetConfirmed { .. }))
        );
    }
}
