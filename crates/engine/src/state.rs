//! The internal state of the engine controller.

use std::time::Instant;

use alloy_rpc_types_engine::ForkchoiceState;
use kona_protocol::L2BlockInfo;

use crate::{Metrics, SyncStatus};

/// The synchronization state of the execution layer across different safety levels.
///
/// Tracks block progression through various stages of verification and finalization,
/// from initial unsafe blocks received over the network to fully finalized blocks
/// derived from finalized L1 data. Each level represents increasing confidence in
/// the block's validity.
///
/// # Safety Levels
///
/// The state tracks blocks at different safety levels, listed from least to most safe:
///
/// 1. **Unsafe** - Most recent blocks from the P2P network (unverified)
/// 2. **Cross-unsafe** - Unsafe blocks with cross-layer verification
/// 3. **Pending-safe** - Derived from L1 data, span-batch not yet complete
/// 4. **Local-safe** - Derived from L1 data as a completed span-batch
/// 5. **Safe** - Cross-verified with safe L1 dependencies
/// 6. **Finalized** - Derived from finalized L1 data only
///
/// A zero [`L2BlockInfo`] means the head at that level is not known yet.
///
/// The backup-unsafe head is not a safety level: it snapshots the previous
/// unsafe head when an update rewinds or replaces the chain tip, so the old
/// tip can be restored if the replacement turns out to be wrong.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineSyncState {
    /// Most recent block found on the P2P network (lowest safety level).
    unsafe_head: L2BlockInfo,
    /// Cross-verified unsafe head.
    cross_unsafe_head: L2BlockInfo,
    /// Derived from L1 data, but the span-batch it belongs to is not complete yet.
    pending_safe_head: L2BlockInfo,
    /// Derived from L1 data as a completed span-batch, but not yet cross-verified.
    local_safe_head: L2BlockInfo,
    /// Derived from L1 data and cross-verified to have safe L1 dependencies.
    safe_head: L2BlockInfo,
    /// Derived from finalized L1 data with only finalized dependencies (highest safety level).
    finalized_head: L2BlockInfo,
    /// Snapshot of a replaced unsafe head, kept for restoring after a bad reorg.
    backup_unsafe_head: L2BlockInfo,
}

impl EngineSyncState {
    /// Returns the current unsafe head.
    pub const fn unsafe_head(&self) -> L2BlockInfo {
        self.unsafe_head
    }

    /// Returns the current cross-verified unsafe head.
    pub const fn cross_unsafe_head(&self) -> L2BlockInfo {
        self.cross_unsafe_head
    }

    /// Returns the current pending safe head.
    pub const fn pending_safe_head(&self) -> L2BlockInfo {
        self.pending_safe_head
    }

    /// Returns the current local safe head.
    pub const fn local_safe_head(&self) -> L2BlockInfo {
        self.local_safe_head
    }

    /// Returns the current safe head.
    pub const fn safe_head(&self) -> L2BlockInfo {
        self.safe_head
    }

    /// Returns the current finalized head.
    pub const fn finalized_head(&self) -> L2BlockInfo {
        self.finalized_head
    }

    /// Returns the current backup unsafe head.
    pub const fn backup_unsafe_head(&self) -> L2BlockInfo {
        self.backup_unsafe_head
    }

    /// Creates a [`ForkchoiceState`]
    ///
    /// - `head_block` = `unsafe_head`
    /// - `safe_block` = `safe_head`
    /// - `finalized_block` = `finalized_head`
    ///
    /// If the block info is not yet available, the default values are used.
    pub const fn create_forkchoice_state(&self) -> ForkchoiceState {
        ForkchoiceState {
            head_block_hash: self.unsafe_head.block_info.hash,
            safe_block_hash: self.safe_head.block_info.hash,
            finalized_block_hash: self.finalized_head.block_info.hash,
        }
    }

    /// Applies the update to the provided sync state, using the current state values if the
    /// update is not specified. Returns the new sync state.
    pub fn apply_update(self, sync_state_update: EngineSyncStateUpdate) -> Self {
        if let Some(unsafe_head) = sync_state_update.unsafe_head {
            Self::update_block_label_metric(
                Metrics::UNSAFE_BLOCK_LABEL,
                unsafe_head.block_info.number,
            );
        }
        if let Some(cross_unsafe_head) = sync_state_update.cross_unsafe_head {
            Self::update_block_label_metric(
                Metrics::CROSS_UNSAFE_BLOCK_LABEL,
                cross_unsafe_head.block_info.number,
            );
        }
        if let Some(pending_safe_head) = sync_state_update.pending_safe_head {
            Self::update_block_label_metric(
                Metrics::PENDING_SAFE_BLOCK_LABEL,
                pending_safe_head.block_info.number,
            );
        }
        if let Some(local_safe_head) = sync_state_update.local_safe_head {
            Self::update_block_label_metric(
                Metrics::LOCAL_SAFE_BLOCK_LABEL,
                local_safe_head.block_info.number,
            );
        }
        if let Some(safe_head) = sync_state_update.safe_head {
            Self::update_block_label_metric(Metrics::SAFE_BLOCK_LABEL, safe_head.block_info.number);
        }
        if let Some(finalized_head) = sync_state_update.finalized_head {
            Self::update_block_label_metric(
                Metrics::FINALIZED_BLOCK_LABEL,
                finalized_head.block_info.number,
            );
        }
        if let Some(backup_unsafe_head) = sync_state_update.backup_unsafe_head {
            Self::update_block_label_metric(
                Metrics::BACKUP_UNSAFE_BLOCK_LABEL,
                backup_unsafe_head.block_info.number,
            );
        }

        Self {
            unsafe_head: sync_state_update.unsafe_head.unwrap_or(self.unsafe_head),
            cross_unsafe_head: sync_state_update
                .cross_unsafe_head
                .unwrap_or(self.cross_unsafe_head),
            pending_safe_head: sync_state_update
                .pending_safe_head
                .unwrap_or(self.pending_safe_head),
            local_safe_head: sync_state_update.local_safe_head.unwrap_or(self.local_safe_head),
            safe_head: sync_state_update.safe_head.unwrap_or(self.safe_head),
            finalized_head: sync_state_update.finalized_head.unwrap_or(self.finalized_head),
            backup_unsafe_head: sync_state_update
                .backup_unsafe_head
                .unwrap_or(self.backup_unsafe_head),
        }
    }

    /// Updates a block label metric, keyed by the label.
    #[inline]
    fn update_block_label_metric(label: &'static str, number: u64) {
        metrics::gauge!(Metrics::BLOCK_LABELS, "label" => label).set(number as f64);
    }
}

/// Specifies how to update the sync state of the engine.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineSyncStateUpdate {
    /// Most recent block found on the p2p network.
    pub unsafe_head: Option<L2BlockInfo>,
    /// Cross-verified unsafe head.
    pub cross_unsafe_head: Option<L2BlockInfo>,
    /// Derived from L1, but not yet concluding a span-batch.
    pub pending_safe_head: Option<L2BlockInfo>,
    /// Derived from L1, and known to be a completed span-batch,
    /// but not cross-verified yet.
    pub local_safe_head: Option<L2BlockInfo>,
    /// Derived from L1 and cross-verified to have cross-safe dependencies.
    pub safe_head: Option<L2BlockInfo>,
    /// Derived from finalized L1 data,
    /// and cross-verified to only have finalized dependencies.
    pub finalized_head: Option<L2BlockInfo>,
    /// Snapshot of a replaced unsafe head. `Some(L2BlockInfo::default())` clears it.
    pub backup_unsafe_head: Option<L2BlockInfo>,
}

/// The chain state viewed by the engine controller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EngineState {
    /// The sync state of the engine.
    pub sync_state: EngineSyncState,

    /// Where the engine is in the sync process.
    pub sync_status: SyncStatus,

    /// When EL sync was triggered, for duration logging.
    pub el_sync_started_at: Option<Instant>,

    /// Whether the forkchoice state of the rollup node still has to be pushed to the
    /// execution layer. Set whenever one of the three forkchoice heads changes.
    pub forkchoice_update_needed: bool,

    /// Tracks when the rollup node changes the forkchoice to restore the previous
    /// known unsafe chain, e.g. an unsafe reorg caused by an invalid span batch.
    /// This update does not retry unless the engine returns a non-input error,
    /// because the engine may have forgotten the backup head or the backup head
    /// may not be part of the chain.
    pub backup_unsafe_reorg_needed: bool,
}

impl EngineState {
    /// Creates a fresh engine state for the given initial [`SyncStatus`].
    ///
    /// An initial forkchoice update is always owed to the execution layer.
    pub fn new(sync_status: SyncStatus) -> Self {
        Self {
            sync_state: EngineSyncState::default(),
            sync_status,
            el_sync_started_at: None,
            forkchoice_update_needed: true,
            backup_unsafe_reorg_needed: false,
        }
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(SyncStatus::default())
    }
}

#[cfg(test)]
mod tests {
    use kona_protocol::BlockInfo;
    use rstest::rstest;

    use super::*;
    use crate::test_utils::l2_block_at;

    #[test]
    fn test_apply_update_partial() {
        let state = EngineSyncState::default();
        let safe = l2_block_at(4);
        let updated = state.apply_update(EngineSyncStateUpdate {
            safe_head: Some(safe),
            ..Default::default()
        });

        assert_eq!(updated.safe_head(), safe);
        assert_eq!(updated.unsafe_head(), L2BlockInfo::default());
        assert_eq!(updated.finalized_head(), L2BlockInfo::default());
    }

    #[test]
    fn test_apply_update_clears_backup() {
        let state = EngineSyncState::default().apply_update(EngineSyncStateUpdate {
            backup_unsafe_head: Some(l2_block_at(7)),
            ..Default::default()
        });
        assert_ne!(state.backup_unsafe_head(), L2BlockInfo::default());

        let cleared = state.apply_update(EngineSyncStateUpdate {
            backup_unsafe_head: Some(L2BlockInfo::default()),
            ..Default::default()
        });
        assert_eq!(cleared.backup_unsafe_head(), L2BlockInfo::default());
    }

    #[rstest]
    #[case::unsafe_head(5)]
    #[case::genesis(0)]
    fn test_create_forkchoice_state(#[case] number: u64) {
        let un_safe = l2_block_at(number);
        let state = EngineSyncState::default().apply_update(EngineSyncStateUpdate {
            unsafe_head: Some(un_safe),
            ..Default::default()
        });

        let fc = state.create_forkchoice_state();
        assert_eq!(fc.head_block_hash, un_safe.block_info.hash);
        assert_eq!(fc.safe_block_hash, BlockInfo::default().hash);
        assert_eq!(fc.finalized_block_hash, BlockInfo::default().hash);
    }

    #[test]
    fn test_new_state_owes_forkchoice_update() {
        let state = EngineState::new(SyncStatus::ConsensusLayer);
        assert!(state.forkchoice_update_needed);
        assert!(!state.backup_unsafe_reorg_needed);
        assert_eq!(state.sync_state, EngineSyncState::default());
    }
}
