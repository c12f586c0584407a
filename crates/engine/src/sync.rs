//! Sync configuration and the EL-sync status of the engine.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// How the node drives the execution layer towards the chain head.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// The node imports every unsafe block itself, verifying the chain block by block.
    #[default]
    ConsensusLayer,
    /// The execution layer syncs to the tip on its own (e.g. snap sync), and the node
    /// only feeds it target heads until the sync is finished.
    ExecutionLayer,
}

impl Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConsensusLayer => write!(f, "consensus-layer"),
            Self::ExecutionLayer => write!(f, "execution-layer"),
        }
    }
}

/// Sync configuration for the engine controller.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// The selected [`SyncMode`].
    pub sync_mode: SyncMode,
    /// Allow EL sync to start even when the execution layer already has a finalized
    /// block. Engines that can re-sync past finality set this.
    pub supports_post_finalization_el_sync: bool,
}

/// Where the engine currently is in the sync process.
///
/// The status only ever moves forward. When EL sync is configured but the
/// execution layer turns out to already have a finalized block, the status
/// skips from [`SyncStatus::WillStartEl`] straight to [`SyncStatus::FinishedEl`].
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    /// Consensus-layer sync; every block is imported and verified by the node.
    #[default]
    ConsensusLayer,
    /// EL sync is configured but has not been triggered by a payload yet.
    WillStartEl,
    /// The execution layer is syncing on its own.
    StartedEl,
    /// The execution layer caught up to the tip, but its head is not marked
    /// finalized yet.
    FinishedElNotFinalized,
    /// EL sync is done; the engine performs consolidation from here on.
    FinishedEl,
}

impl SyncStatus {
    /// The initial status for the given [`SyncMode`].
    pub const fn from_sync_mode(mode: SyncMode) -> Self {
        match mode {
            SyncMode::ConsensusLayer => Self::ConsensusLayer,
            SyncMode::ExecutionLayer => Self::WillStartEl,
        }
    }

    /// Returns whether the execution layer is (about to be) syncing on its own.
    pub const fn is_engine_syncing(&self) -> bool {
        matches!(self, Self::WillStartEl | Self::StartedEl | Self::FinishedElNotFinalized)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::cl(SyncMode::ConsensusLayer, SyncStatus::ConsensusLayer)]
    #[case::el(SyncMode::ExecutionLayer, SyncStatus::WillStartEl)]
    fn test_initial_status(#[case] mode: SyncMode, #[case] expected: SyncStatus) {
        assert_eq!(SyncStatus::from_sync_mode(mode), expected);
    }

    #[rstest]
    #[case::cl(SyncStatus::ConsensusLayer, false)]
    #[case::will_start(SyncStatus::WillStartEl, true)]
    #[case::started(SyncStatus::StartedEl, true)]
    #[case::not_finalized(SyncStatus::FinishedElNotFinalized, true)]
    #[case::finished(SyncStatus::FinishedEl, false)]
    fn test_is_engine_syncing(#[case] status: SyncStatus, #[case] syncing: bool) {
        assert_eq!(status.is_engine_syncing(), syncing);
    }
}
