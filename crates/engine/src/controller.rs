//! The engine controller.
//!
//! Owns the node's view of the L2 head state across all safety levels and reconciles
//! it with the execution layer through the Engine API.

use std::{sync::Arc, time::Instant};

use alloy_eips::eip1898::BlockNumberOrTag;
use alloy_rpc_types_engine::{ForkchoiceState, PayloadStatusEnum};
use async_trait::async_trait;
use kona_genesis::RollupConfig;
use kona_protocol::{BlockInfo, L2BlockInfo};
use op_alloy_rpc_types_engine::OpExecutionPayloadEnvelope;
use tokio::sync::RwLock;

use crate::{
    EngineClient, EngineControllerError, EngineForkchoiceVersion, EngineState, EngineSyncState,
    EngineSyncStateUpdate, ErrorSeverity, Event, EventEmitter, EventHandler, Metrics, SyncConfig,
    SyncMode, SyncStatus,
};

/// Notified when EL sync is triggered by the first incoming unsafe payload.
#[async_trait]
pub trait ElSyncListener: Send + Sync {
    /// EL sync started; the execution layer is now syncing towards the tip on its own.
    async fn on_el_sync_started(&self);
}

/// An attributes-building component that must be re-synchronized on a forced engine reset.
#[async_trait]
pub trait AttributesResetter: Send + Sync {
    /// Drops any pending attributes and adopts the given post-reset heads.
    async fn force_reset(
        &self,
        local_unsafe: L2BlockInfo,
        cross_unsafe: L2BlockInfo,
        local_safe: L2BlockInfo,
        cross_safe: L2BlockInfo,
        finalized: L2BlockInfo,
    );
}

/// A derivation pipeline that must be reset alongside the engine.
#[async_trait]
pub trait PipelineResetter: Send + Sync {
    /// Resets the pipeline to its initial state.
    async fn reset_pipeline(&self);
}

/// An L1 origin selector that must be reset alongside the engine. Only present when
/// sequencing is enabled.
#[async_trait]
pub trait OriginSelectorResetter: Send + Sync {
    /// Drops any cached origin selection.
    async fn reset_origins(&self);
}

/// Receives cross-safety head updates, e.g. to feed an interop supervisor.
#[async_trait]
pub trait CrossUpdateHandler: Send + Sync {
    /// The cross-unsafe head changed.
    async fn on_cross_unsafe_update(&self, cross_unsafe: L2BlockInfo, local_unsafe: L2BlockInfo);
    /// The cross-safe head changed.
    async fn on_cross_safe_update(&self, cross_safe: L2BlockInfo, local_safe: L2BlockInfo);
}

/// Requests a forkchoice-update broadcast without depending on the controller type.
#[async_trait]
pub trait ForkchoiceRequester: Send + Sync {
    /// Emits a forkchoice-update event carrying the current heads.
    async fn request_forkchoice_update(&self);
}

/// The engine controller.
///
/// All head-state mutation goes through the [`RwLock`]ed [`EngineState`]; event
/// handlers and the synchronous entry points hold the write guard for the duration
/// of their engine interaction, so state transitions are never observed half-done.
///
/// Dependent components (attributes builder, pipeline, origin selector, cross-update
/// handler, EL-sync listener) are optional; an absent component is a silent no-op.
pub struct EngineController<C: EngineClient> {
    /// The engine API client.
    pub(crate) client: Arc<C>,
    /// The rollup config.
    pub(crate) cfg: Arc<RollupConfig>,
    /// The sync configuration.
    pub(crate) sync_cfg: SyncConfig,
    /// The event emitter.
    pub(crate) emitter: Arc<dyn EventEmitter>,
    /// The engine state.
    pub(crate) state: RwLock<EngineState>,
    /// Notified when EL sync starts.
    pub(crate) el_sync_listener: Option<Arc<dyn ElSyncListener>>,
    /// Attributes component to notify on forced resets.
    pub(crate) attributes_resetter: Option<Arc<dyn AttributesResetter>>,
    /// Pipeline component to notify on forced resets.
    pub(crate) pipeline_resetter: Option<Arc<dyn PipelineResetter>>,
    /// Origin selector to notify on forced resets.
    pub(crate) origin_selector_resetter: Option<Arc<dyn OriginSelectorResetter>>,
    /// Cross-safety update sink.
    pub(crate) cross_update_handler: Option<Arc<dyn CrossUpdateHandler>>,
}

impl<C: EngineClient> std::fmt::Debug for EngineController<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineController")
            .field("sync_cfg", &self.sync_cfg)
            .finish_non_exhaustive()
    }
}

impl<C: EngineClient> EngineController<C> {
    /// Creates a new engine controller.
    pub fn new(
        client: Arc<C>,
        cfg: Arc<RollupConfig>,
        sync_cfg: SyncConfig,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            state: RwLock::new(EngineState::new(SyncStatus::from_sync_mode(sync_cfg.sync_mode))),
            client,
            cfg,
            sync_cfg,
            emitter,
            el_sync_listener: None,
            attributes_resetter: None,
            pipeline_resetter: None,
            origin_selector_resetter: None,
            cross_update_handler: None,
        }
    }

    /// Sets the EL-sync listener.
    pub fn set_el_sync_listener(&mut self, listener: Arc<dyn ElSyncListener>) {
        self.el_sync_listener = Some(listener);
    }

    /// Sets the attributes component that needs force reset notifications.
    pub fn set_attributes_resetter(&mut self, resetter: Arc<dyn AttributesResetter>) {
        self.attributes_resetter = Some(resetter);
    }

    /// Sets the pipeline component that needs force reset notifications.
    pub fn set_pipeline_resetter(&mut self, resetter: Arc<dyn PipelineResetter>) {
        self.pipeline_resetter = Some(resetter);
    }

    /// Sets the origin selector component that needs force reset notifications.
    pub fn set_origin_selector_resetter(&mut self, resetter: Arc<dyn OriginSelectorResetter>) {
        self.origin_selector_resetter = Some(resetter);
    }

    /// Sets the cross-safety update handler.
    pub fn set_cross_update_handler(&mut self, handler: Arc<dyn CrossUpdateHandler>) {
        self.cross_update_handler = Some(handler);
    }

    // Getters

    /// Returns the current unsafe head.
    pub async fn unsafe_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.unsafe_head()
    }

    /// Returns the current cross-unsafe head.
    pub async fn cross_unsafe_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.cross_unsafe_head()
    }

    /// Returns the current pending safe head.
    pub async fn pending_safe_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.pending_safe_head()
    }

    /// Returns the current local safe head.
    pub async fn local_safe_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.local_safe_head()
    }

    /// Returns the current safe head.
    pub async fn safe_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.safe_head()
    }

    /// Returns the current finalized head.
    pub async fn finalized_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.finalized_head()
    }

    /// Returns the current backup unsafe head.
    pub async fn backup_unsafe_head(&self) -> L2BlockInfo {
        self.state.read().await.sync_state.backup_unsafe_head()
    }

    /// Returns the current [`SyncStatus`].
    pub async fn sync_status(&self) -> SyncStatus {
        self.state.read().await.sync_status
    }

    /// Returns whether the execution layer is (about to be) syncing on its own.
    pub async fn is_engine_syncing(&self) -> bool {
        self.state.read().await.sync_status.is_engine_syncing()
    }

    // Internals

    /// Translates an error into the event matching its severity.
    pub(crate) fn emit_engine_error(&self, err: &EngineControllerError) {
        match err.severity() {
            ErrorSeverity::Reset => self.emitter.emit(Event::ResetRequested(err.to_string())),
            ErrorSeverity::Temporary => {
                self.emitter.emit(Event::TemporaryEngineError(err.to_string()))
            }
            ErrorSeverity::Critical => self.emitter.emit(Event::CriticalError(err.to_string())),
        }
    }

    /// Applies a sync state update. Changing any of the three forkchoice heads means a
    /// forkchoice update is owed to the execution layer.
    pub(crate) fn apply_sync_update(&self, st: &mut EngineState, update: EngineSyncStateUpdate) {
        if update.unsafe_head.is_some()
            || update.safe_head.is_some()
            || update.finalized_head.is_some()
        {
            st.forkchoice_update_needed = true;
        }
        st.sync_state = st.sync_state.apply_update(update);
    }

    /// Logs forkchoice progress if the last engine interaction both succeeded and moved
    /// one of the heads. `prev` is the sync state snapshotted before the interaction.
    fn log_sync_progress(&self, prev: &EngineSyncState, st: &EngineState) {
        if st.forkchoice_update_needed || st.backup_unsafe_reorg_needed {
            return;
        }
        let cur = &st.sync_state;
        let reason = if prev.finalized_head() != cur.finalized_head() {
            "finalized block"
        } else if prev.safe_head() != cur.safe_head() {
            if prev.safe_head() == prev.unsafe_head() {
                "derived safe block from L1"
            } else {
                "consolidated block with L1"
            }
        } else if prev.unsafe_head() != cur.unsafe_head() {
            "new chain head block"
        } else if prev.pending_safe_head() != cur.pending_safe_head() {
            "pending new safe block"
        } else if prev.backup_unsafe_head() != cur.backup_unsafe_head() {
            "new backup unsafe block"
        } else {
            return;
        };
        info!(
            target: "engine",
            reason,
            l2_finalized = %cur.finalized_head().block_info.hash,
            l2_safe = %cur.safe_head().block_info.hash,
            l2_pending_safe = %cur.pending_safe_head().block_info.hash,
            l2_unsafe = %cur.unsafe_head().block_info.hash,
            l2_backup_unsafe = %cur.backup_unsafe_head().block_info.hash,
            l2_time = cur.unsafe_head().block_info.timestamp,
            "Sync progress"
        );
    }

    /// Lazily loads any heads that are still unknown from the execution layer.
    ///
    /// The initial reset triggers a sync-start search and overwrites whatever is
    /// initialized here; this exists so the controller can interact with the engine
    /// before that reset lands.
    async fn initialize_unknowns(
        &self,
        st: &mut EngineState,
    ) -> Result<(), EngineControllerError> {
        let zero = L2BlockInfo::default();
        if st.sync_state.unsafe_head() == zero {
            let head = self
                .client
                .l2_block_info_by_label(BlockNumberOrTag::Latest)
                .await
                .map_err(|source| EngineControllerError::HeadLookup { label: "local-unsafe", source })?
                .ok_or(EngineControllerError::MissingBlock("local-unsafe"))?;
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { unsafe_head: Some(head), ..Default::default() },
            );
            info!(target: "engine", number = head.block_info.number, hash = %head.block_info.hash, "Loaded initial local-unsafe block ref");
        }
        if st.sync_state.finalized_head() == zero {
            let finalized = match self
                .client
                .l2_block_info_by_label(BlockNumberOrTag::Finalized)
                .await
                .map_err(|source| EngineControllerError::HeadLookup { label: "finalized", source })?
            {
                Some(finalized) => finalized,
                // Nothing is finalized yet; fall back to genesis.
                None => self
                    .client
                    .l2_block_info_by_label(BlockNumberOrTag::Number(self.cfg.genesis.l2.number))
                    .await
                    .map_err(|source| EngineControllerError::HeadLookup { label: "finalized", source })?
                    .ok_or(EngineControllerError::MissingBlock("finalized"))?,
            };
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { finalized_head: Some(finalized), ..Default::default() },
            );
            info!(target: "engine", number = finalized.block_info.number, hash = %finalized.block_info.hash, "Loaded initial finalized block ref");
        }
        if st.sync_state.safe_head() == zero {
            let safe = self
                .client
                .l2_block_info_by_label(BlockNumberOrTag::Safe)
                .await
                .map_err(|source| EngineControllerError::HeadLookup { label: "cross-safe", source })?
                // If the engine doesn't have a safe head, the finalized head serves.
                .unwrap_or(st.sync_state.finalized_head());
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { safe_head: Some(safe), ..Default::default() },
            );
            info!(target: "engine", number = safe.block_info.number, hash = %safe.block_info.hash, "Loaded initial cross-safe block ref");
        }
        if st.sync_state.cross_unsafe_head() == zero {
            // Preserve cross-safety; don't fall back to a non-cross safety level.
            let safe = st.sync_state.safe_head();
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { cross_unsafe_head: Some(safe), ..Default::default() },
            );
            info!(target: "engine", number = safe.block_info.number, "Set initial cross-unsafe block ref to match cross-safe");
        }
        if st.sync_state.local_safe_head() == zero {
            let safe = st.sync_state.safe_head();
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { local_safe_head: Some(safe), ..Default::default() },
            );
            info!(target: "engine", number = safe.block_info.number, "Set initial local-safe block ref to match cross-safe");
        }
        Ok(())
    }

    /// Checks the response of the `engine_newPayload` call for an unsafe payload, and
    /// advances the sync status when a valid payload ends EL sync.
    fn check_new_payload_status(&self, st: &mut EngineState, status: &PayloadStatusEnum) -> bool {
        if self.sync_cfg.sync_mode == SyncMode::ExecutionLayer {
            if matches!(status, PayloadStatusEnum::Valid)
                && st.sync_status == SyncStatus::StartedEl
            {
                st.sync_status = SyncStatus::FinishedElNotFinalized;
            }
            // Allow SYNCING and ACCEPTED if engine EL sync is enabled.
            return matches!(
                status,
                PayloadStatusEnum::Valid | PayloadStatusEnum::Syncing | PayloadStatusEnum::Accepted
            );
        }
        matches!(status, PayloadStatusEnum::Valid)
    }

    /// Checks the response of the `engine_forkchoiceUpdated` call for an unsafe payload,
    /// and advances the sync status when a valid response ends EL sync.
    fn check_forkchoice_updated_status(
        &self,
        st: &mut EngineState,
        status: &PayloadStatusEnum,
    ) -> bool {
        if self.sync_cfg.sync_mode == SyncMode::ExecutionLayer {
            if matches!(status, PayloadStatusEnum::Valid)
                && st.sync_status == SyncStatus::StartedEl
            {
                st.sync_status = SyncStatus::FinishedElNotFinalized;
            }
            // Allow SYNCING if engine EL sync is enabled.
            return matches!(status, PayloadStatusEnum::Valid | PayloadStatusEnum::Syncing);
        }
        matches!(status, PayloadStatusEnum::Valid)
    }

    /// Attempts to update the execution layer with the current forkchoice state of the
    /// rollup node. This is a no-op if no forkchoice update is owed.
    pub async fn try_update_engine(&self) -> Result<(), EngineControllerError> {
        let mut st = self.state.write().await;
        self.try_update_engine_locked(&mut st).await
    }

    pub(crate) async fn try_update_engine_locked(
        &self,
        st: &mut EngineState,
    ) -> Result<(), EngineControllerError> {
        if !st.forkchoice_update_needed {
            return Ok(());
        }
        if st.sync_status.is_engine_syncing() {
            warn!(target: "engine", "Attempting to update forkchoice state while EL syncing");
        }
        self.initialize_unknowns(st).await?;
        let sync = st.sync_state;
        if sync.unsafe_head().block_info.number < sync.finalized_head().block_info.number {
            return Err(EngineControllerError::FinalizedAheadOfUnsafe {
                unsafe_number: sync.unsafe_head().block_info.number,
                finalized_number: sync.finalized_head().block_info.number,
            });
        }
        let prev = sync;
        let fc = sync.create_forkchoice_state();
        let version =
            EngineForkchoiceVersion::from_cfg(&self.cfg, sync.unsafe_head().block_info.timestamp);
        let res = self
            .client
            .fork_choice_updated(fc, None, version)
            .await
            .map_err(EngineControllerError::from_fcu_rpc_error)?;
        if res.payload_status.status == PayloadStatusEnum::Valid {
            self.emitter.emit(Event::ForkchoiceUpdate {
                unsafe_head: sync.unsafe_head(),
                safe_head: sync.safe_head(),
                finalized_head: sync.finalized_head(),
            });
        }
        if sync.unsafe_head() == sync.safe_head() && sync.safe_head() == sync.pending_safe_head() {
            // Remove the backup unsafe head; it will never be used after consolidation.
            st.sync_state = st.sync_state.apply_update(EngineSyncStateUpdate {
                backup_unsafe_head: Some(L2BlockInfo::default()),
                ..Default::default()
            });
            st.backup_unsafe_reorg_needed = false;
        }
        st.forkchoice_update_needed = false;
        self.log_sync_progress(&prev, st);
        Ok(())
    }

    /// Runs [`Self::try_update_engine_locked`] and reports any failure as an event.
    pub(crate) async fn update_engine_and_report(&self, st: &mut EngineState) {
        if let Err(err) = self.try_update_engine_locked(st).await {
            self.emit_engine_error(&err);
        }
    }

    /// Inserts an unsafe payload into the execution layer and canonicalizes it.
    pub async fn insert_unsafe_payload(
        &self,
        envelope: Arc<OpExecutionPayloadEnvelope>,
        block_ref: L2BlockInfo,
    ) -> Result<(), EngineControllerError> {
        let mut st = self.state.write().await;
        self.apply_unsafe_payload(&mut st, &envelope, block_ref).await
    }

    /// The insertion routine behind both the synchronous [`Self::insert_unsafe_payload`]
    /// entry point and the process-unsafe-payload event handler.
    async fn apply_unsafe_payload(
        &self,
        st: &mut EngineState,
        envelope: &Arc<OpExecutionPayloadEnvelope>,
        block_ref: L2BlockInfo,
    ) -> Result<(), EngineControllerError> {
        // Check once for a finalized head when EL sync is pending. If a real one exists,
        // transition straight to CL sync.
        if st.sync_status == SyncStatus::WillStartEl {
            let finalized = self
                .client
                .l2_block_info_by_label(BlockNumberOrTag::Finalized)
                .await
                .map_err(|source| EngineControllerError::HeadLookup { label: "finalized", source })?;
            let genesis_is_finalized = finalized
                .is_some_and(|finalized| finalized.block_info.hash == self.cfg.genesis.l2.hash);
            match finalized {
                Some(finalized)
                    if !genesis_is_finalized
                        && !self.sync_cfg.supports_post_finalization_el_sync =>
                {
                    st.sync_status = SyncStatus::FinishedEl;
                    info!(
                        target: "engine",
                        id = ?finalized.block_info.id(),
                        "Skipping EL sync and going straight to CL sync because there is a finalized block"
                    );
                    return Ok(());
                }
                _ => {
                    st.sync_status = SyncStatus::StartedEl;
                    st.el_sync_started_at = Some(Instant::now());
                    info!(target: "engine", "Starting EL sync");
                    if let Some(listener) = &self.el_sync_listener {
                        listener.on_el_sync_started().await;
                    }
                }
            }
        }

        let prev = st.sync_state;

        // Insert the payload, then call FCU.
        let new_payload_start = Instant::now();
        let status = self
            .client
            .new_payload(envelope.execution_payload.clone(), envelope.parent_beacon_block_root)
            .await
            .map_err(EngineControllerError::NewPayloadFailed)?;
        if let PayloadStatusEnum::Invalid { validation_error } = &status.status {
            warn!(target: "engine", %validation_error, "Received invalid unsafe payload");
            self.emitter.emit(Event::PayloadInvalid { envelope: Arc::clone(envelope) });
        }
        if !self.check_new_payload_status(st, &status.status) {
            return Err(EngineControllerError::UnexpectedPayloadStatus(status.status));
        }
        let new_payload_duration = new_payload_start.elapsed();

        // Mark the new payload as canonical.
        let mut fc = ForkchoiceState {
            head_block_hash: block_ref.block_info.hash,
            safe_block_hash: st.sync_state.safe_head().block_info.hash,
            finalized_block_hash: st.sync_state.finalized_head().block_info.hash,
        };
        if st.sync_status == SyncStatus::FinishedElNotFinalized {
            // The EL synced up to this payload; it becomes the safe and finalized tip.
            fc.safe_block_hash = block_ref.block_info.hash;
            fc.finalized_block_hash = block_ref.block_info.hash;
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { unsafe_head: Some(block_ref), ..Default::default() },
            );
            self.emitter.emit(Event::UnsafeUpdate(block_ref));
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate {
                    local_safe_head: Some(block_ref),
                    safe_head: Some(block_ref),
                    ..Default::default()
                },
            );
            if let Some(handler) = &self.cross_update_handler {
                handler.on_cross_safe_update(block_ref, block_ref).await;
            }
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { finalized_head: Some(block_ref), ..Default::default() },
            );
        }

        let fcu_start = Instant::now();
        let version =
            EngineForkchoiceVersion::from_cfg(&self.cfg, block_ref.block_info.timestamp);
        let res = self
            .client
            .fork_choice_updated(fc, None, version)
            .await
            .map_err(EngineControllerError::from_fcu_rpc_error)?;
        if !self.check_forkchoice_updated_status(st, &res.payload_status.status) {
            return Err(EngineControllerError::UnexpectedPayloadStatus(
                res.payload_status.status.clone(),
            ));
        }
        let fcu_duration = fcu_start.elapsed();

        self.apply_sync_update(
            st,
            EngineSyncStateUpdate { unsafe_head: Some(block_ref), ..Default::default() },
        );
        st.forkchoice_update_needed = false;
        self.emitter.emit(Event::UnsafeUpdate(block_ref));

        if st.sync_status == SyncStatus::FinishedElNotFinalized {
            info!(
                target: "engine",
                sync_duration = ?st.el_sync_started_at.map(|started| started.elapsed()),
                finalized_block = ?block_ref.block_info.id(),
                "Finished EL sync"
            );
            st.sync_status = SyncStatus::FinishedEl;
        }

        if res.payload_status.status == PayloadStatusEnum::Valid {
            self.emitter.emit(Event::ForkchoiceUpdate {
                unsafe_head: st.sync_state.unsafe_head(),
                safe_head: st.sync_state.safe_head(),
                finalized_head: st.sync_state.finalized_head(),
            });
        }

        self.log_sync_progress(&prev, st);
        info!(
            target: "engine",
            hash = %block_ref.block_info.hash,
            number = block_ref.block_info.number,
            new_payload_duration = ?new_payload_duration,
            fcu_duration = ?fcu_duration,
            "Inserted new L2 unsafe block"
        );
        Ok(())
    }

    /// Attempts to restore the unsafe head to the backup unsafe head. Returns whether a
    /// forkchoice update was attempted.
    ///
    /// The attempt is made at most once: the engine may have forgotten the backup head, or
    /// the backup head may not be part of the chain. Only transport-level failures re-arm
    /// the retry.
    pub async fn try_backup_unsafe_reorg(&self) -> Result<bool, EngineControllerError> {
        let mut st = self.state.write().await;
        self.try_backup_unsafe_reorg_locked(&mut st).await
    }

    async fn try_backup_unsafe_reorg_locked(
        &self,
        st: &mut EngineState,
    ) -> Result<bool, EngineControllerError> {
        if !st.backup_unsafe_reorg_needed {
            return Ok(false);
        }
        if st.sync_status.is_engine_syncing() {
            warn!(target: "engine", "Attempting to unsafe reorg using backup unsafe head while EL syncing");
            return Ok(false);
        }
        let backup = st.sync_state.backup_unsafe_head();
        if backup == L2BlockInfo::default() {
            warn!(target: "engine", "Attempting to unsafe reorg using backup unsafe head even though it is empty");
            st.backup_unsafe_reorg_needed = false;
            return Ok(false);
        }
        st.backup_unsafe_reorg_needed = false;

        let prev = st.sync_state;
        let sync = st.sync_state;
        warn!(
            target: "engine",
            backup_unsafe = ?backup.block_info.id(),
            unsafe_head = ?sync.unsafe_head().block_info.id(),
            "Trying to restore unsafe head"
        );
        // Reorg the unsafe chain; the safe and finalized chain are not updated.
        let fc = ForkchoiceState {
            head_block_hash: backup.block_info.hash,
            safe_block_hash: sync.safe_head().block_info.hash,
            finalized_block_hash: sync.finalized_head().block_info.hash,
        };
        let version =
            EngineForkchoiceVersion::from_cfg(&self.cfg, backup.block_info.timestamp);
        match self.client.fork_choice_updated(fc, None, version).await {
            Err(err) => {
                let err = EngineControllerError::from_fcu_rpc_error(err);
                if err.severity() == ErrorSeverity::Reset {
                    // The engine does not know the backup head; drop it.
                    st.sync_state = st.sync_state.apply_update(EngineSyncStateUpdate {
                        backup_unsafe_head: Some(L2BlockInfo::default()),
                        ..Default::default()
                    });
                } else {
                    // Retry; the backup head will be used again.
                    st.backup_unsafe_reorg_needed = true;
                }
                Err(err)
            }
            Ok(res) if res.payload_status.status == PayloadStatusEnum::Valid => {
                self.emitter.emit(Event::ForkchoiceUpdate {
                    unsafe_head: backup,
                    safe_head: sync.safe_head(),
                    finalized_head: sync.finalized_head(),
                });
                info!(target: "engine", unsafe_head = ?backup.block_info.id(), "Successfully reorged unsafe head using backup");
                self.apply_sync_update(
                    st,
                    EngineSyncStateUpdate {
                        unsafe_head: Some(backup),
                        backup_unsafe_head: Some(L2BlockInfo::default()),
                        ..Default::default()
                    },
                );
                st.forkchoice_update_needed = false;
                self.log_sync_progress(&prev, st);
                Ok(true)
            }
            Ok(res) => {
                // The engine could not reorg back to the previous unsafe head.
                st.sync_state = st.sync_state.apply_update(EngineSyncStateUpdate {
                    backup_unsafe_head: Some(L2BlockInfo::default()),
                    ..Default::default()
                });
                Err(EngineControllerError::UnexpectedPayloadStatus(res.payload_status.status))
            }
        }
    }

    // Promotions

    /// Updates the pending safe head if the new reference is newer.
    pub async fn try_update_pending_safe(&self, block_ref: L2BlockInfo, concluding: bool) {
        let mut st = self.state.write().await;
        self.try_update_pending_safe_locked(&mut st, block_ref, concluding);
    }

    pub(crate) fn try_update_pending_safe_locked(
        &self,
        st: &mut EngineState,
        block_ref: L2BlockInfo,
        concluding: bool,
    ) {
        // Only promote if not already stale. Resets and overwrites happen through
        // engine resets, not through promotion.
        if block_ref.block_info.number > st.sync_state.pending_safe_head().block_info.number {
            debug!(
                target: "engine",
                pending_safe = %block_ref.block_info.hash,
                number = block_ref.block_info.number,
                concluding,
                "Updating pending safe"
            );
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { pending_safe_head: Some(block_ref), ..Default::default() },
            );
            self.emitter.emit(Event::PendingSafeUpdate {
                pending_safe: st.sync_state.pending_safe_head(),
                unsafe_head: st.sync_state.unsafe_head(),
            });
        }
    }

    /// Updates the local safe head if the new reference is newer and concludes its
    /// span-batch.
    pub async fn try_update_local_safe(
        &self,
        block_ref: L2BlockInfo,
        concluding: bool,
        source: BlockInfo,
    ) {
        let mut st = self.state.write().await;
        self.try_update_local_safe_locked(&mut st, block_ref, concluding, source);
    }

    pub(crate) fn try_update_local_safe_locked(
        &self,
        st: &mut EngineState,
        block_ref: L2BlockInfo,
        concluding: bool,
        source: BlockInfo,
    ) {
        if concluding
            && block_ref.block_info.number > st.sync_state.local_safe_head().block_info.number
        {
            debug!(
                target: "engine",
                local_safe = %block_ref.block_info.hash,
                number = block_ref.block_info.number,
                "Updating local safe"
            );
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { local_safe_head: Some(block_ref), ..Default::default() },
            );
            self.emitter.emit(Event::LocalSafeUpdate { block: block_ref, source });
        }
    }

    /// Updates the unsafe head, snapshotting the previous one as backup when the update
    /// does not extend the chain.
    pub async fn try_update_unsafe(&self, block_ref: L2BlockInfo) {
        let mut st = self.state.write().await;
        self.try_update_unsafe_locked(&mut st, block_ref);
    }

    pub(crate) fn try_update_unsafe_locked(&self, st: &mut EngineState, block_ref: L2BlockInfo) {
        // Back up the unsafe head when the new block is not built on top of it.
        let current = st.sync_state.unsafe_head();
        if current.block_info.number >= block_ref.block_info.number {
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { backup_unsafe_head: Some(current), ..Default::default() },
            );
        }
        self.apply_sync_update(
            st,
            EngineSyncStateUpdate { unsafe_head: Some(block_ref), ..Default::default() },
        );
        self.emitter.emit(Event::UnsafeUpdate(block_ref));
    }

    /// Promotes the block to the (cross-)safe level, pulling the cross-unsafe head along
    /// if it fell behind.
    pub async fn promote_safe(&self, block_ref: L2BlockInfo, source: BlockInfo) {
        let mut st = self.state.write().await;
        self.promote_safe_locked(&mut st, block_ref, source).await;
    }

    pub(crate) async fn promote_safe_locked(
        &self,
        st: &mut EngineState,
        block_ref: L2BlockInfo,
        source: BlockInfo,
    ) {
        debug!(target: "engine", safe = %block_ref.block_info.hash, number = block_ref.block_info.number, "Updating safe");
        self.apply_sync_update(
            st,
            EngineSyncStateUpdate { safe_head: Some(block_ref), ..Default::default() },
        );
        // The finalizer can pick up this cross-safe block now.
        self.emitter.emit(Event::SafeDerived { safe: block_ref, source });
        if let Some(handler) = &self.cross_update_handler {
            handler
                .on_cross_safe_update(st.sync_state.safe_head(), st.sync_state.local_safe_head())
                .await;
        }
        if block_ref.block_info.number > st.sync_state.cross_unsafe_head().block_info.number {
            debug!(target: "engine", number = block_ref.block_info.number, "Cross-unsafe head is stale, updating to match cross-safe");
            self.apply_sync_update(
                st,
                EngineSyncStateUpdate { cross_unsafe_head: Some(block_ref), ..Default::default() },
            );
            if let Some(handler) = &self.cross_update_handler {
                handler.on_cross_unsafe_update(block_ref, st.sync_state.unsafe_head()).await;
            }
        }
        self.update_engine_and_report(st).await;
    }

    /// Promotes the block to the finalized level. Finality never rewinds, and a block
    /// must be safe before it can be finalized.
    pub async fn promote_finalized(&self, block_ref: L2BlockInfo) {
        let mut st = self.state.write().await;
        self.promote_finalized_locked(&mut st, block_ref).await;
    }

    pub(crate) async fn promote_finalized_locked(
        &self,
        st: &mut EngineState,
        block_ref: L2BlockInfo,
    ) {
        if block_ref.block_info.number < st.sync_state.finalized_head().block_info.number {
            error!(
                target: "engine",
                number = block_ref.block_info.number,
                finalized = st.sync_state.finalized_head().block_info.number,
                "Cannot rewind finality"
            );
            return;
        }
        if block_ref.block_info.number > st.sync_state.safe_head().block_info.number {
            error!(
                target: "engine",
                number = block_ref.block_info.number,
                safe = st.sync_state.safe_head().block_info.number,
                "Block must be safe before it can be finalized"
            );
            return;
        }
        self.apply_sync_update(
            st,
            EngineSyncStateUpdate { finalized_head: Some(block_ref), ..Default::default() },
        );
        self.emitter.emit(Event::FinalizedUpdate(block_ref));
        self.update_engine_and_report(st).await;
    }

    /// Performs a forced reset to the specified block references.
    ///
    /// Dependent components are notified first, then the heads are overwritten
    /// atomically (the pending-safe head adopts the local-safe head and the backup
    /// unsafe head is dropped), and finally the new forkchoice is pushed to the
    /// execution layer.
    pub async fn force_reset(
        &self,
        local_unsafe: L2BlockInfo,
        cross_unsafe: L2BlockInfo,
        local_safe: L2BlockInfo,
        cross_safe: L2BlockInfo,
        finalized: L2BlockInfo,
    ) {
        let mut st = self.state.write().await;

        // Reset other components before resetting the engine.
        if let Some(resetter) = &self.attributes_resetter {
            resetter.force_reset(local_unsafe, cross_unsafe, local_safe, cross_safe, finalized).await;
        }
        if let Some(resetter) = &self.pipeline_resetter {
            resetter.reset_pipeline().await;
        }
        if let Some(resetter) = &self.origin_selector_resetter {
            resetter.reset_origins().await;
        }

        self.apply_sync_update(
            &mut st,
            EngineSyncStateUpdate {
                unsafe_head: Some(local_unsafe),
                cross_unsafe_head: Some(cross_unsafe),
                pending_safe_head: Some(local_safe),
                local_safe_head: Some(local_safe),
                safe_head: Some(cross_safe),
                finalized_head: Some(finalized),
                backup_unsafe_head: Some(L2BlockInfo::default()),
            },
        );
        st.backup_unsafe_reorg_needed = false;

        if self.pipeline_resetter.is_some() {
            self.emitter.emit(Event::ConfirmPipelineReset);
        }

        // Time to apply the changes to the underlying engine.
        self.update_engine_and_report(&mut st).await;

        metrics::counter!(Metrics::ENGINE_RESET_COUNT).increment(1);

        // Emit the applied getter values, not the requested ones.
        let sync = st.sync_state;
        self.emitter.emit(Event::EngineResetConfirmed {
            local_unsafe: sync.unsafe_head(),
            cross_unsafe: sync.cross_unsafe_head(),
            local_safe: sync.local_safe_head(),
            cross_safe: sync.safe_head(),
            finalized: sync.finalized_head(),
        });
        info!(
            target: "engine",
            local_unsafe = %sync.unsafe_head().block_info.hash,
            cross_unsafe = %sync.cross_unsafe_head().block_info.hash,
            local_safe = %sync.local_safe_head().block_info.hash,
            cross_safe = %sync.safe_head().block_info.hash,
            finalized = %sync.finalized_head().block_info.hash,
            "Reset of engine is completed"
        );
    }

    // Event handling internals

    async fn on_process_unsafe_payload(&self, envelope: &Arc<OpExecutionPayloadEnvelope>) {
        let block_ref = match L2BlockInfo::from_payload_and_genesis(
            envelope.execution_payload.clone(),
            envelope.parent_beacon_block_root,
            &self.cfg.genesis,
        ) {
            Ok(block_ref) => block_ref,
            Err(err) => {
                error!(target: "engine", %err, "Failed to decode L2 block ref from payload");
                return;
            }
        };
        let mut st = self.state.write().await;
        // A forkchoice update re-emits the queue head as process-unsafe-payload, so the
        // same block can be queued for processing several times while the queue drains.
        if block_ref.block_info.id() == st.sync_state.unsafe_head().block_info.id() {
            return;
        }
        match self.apply_unsafe_payload(&mut st, envelope, block_ref).await {
            Ok(()) => {
                info!(
                    target: "engine",
                    number = block_ref.block_info.number,
                    hash = %block_ref.block_info.hash,
                    "Successfully processed payload"
                );
            }
            Err(err) => {
                info!(
                    target: "engine",
                    number = block_ref.block_info.number,
                    %err,
                    "Failed to insert payload"
                );
                self.emit_engine_error(&err);
            }
        }
    }
}

#[async_trait]
impl<C: EngineClient> ForkchoiceRequester for EngineController<C> {
    async fn request_forkchoice_update(&self) {
        let sync = self.state.read().await.sync_state;
        self.emitter.emit(Event::ForkchoiceUpdate {
            unsafe_head: sync.unsafe_head(),
            safe_head: sync.safe_head(),
            finalized_head: sync.finalized_head(),
        });
    }
}

#[async_trait]
impl<C: EngineClient> EventHandler for EngineController<C> {
    async fn on_event(&self, event: &Event) -> bool {
        match event {
            Event::ProcessUnsafePayload { envelope } => {
                self.on_process_unsafe_payload(envelope).await;
            }
            Event::UnsafeUpdate(block_ref) => {
                // Pre-interop, everything that is local-unsafe is also immediately
                // cross-unsafe.
                if !self.cfg.is_interop_active(block_ref.block_info.timestamp) {
                    self.emitter.emit(Event::PromoteCrossUnsafe(*block_ref));
                }
                let mut st = self.state.write().await;
                self.update_engine_and_report(&mut st).await;
            }
            Event::PromoteCrossUnsafe(block_ref) => {
                let mut st = self.state.write().await;
                self.apply_sync_update(
                    &mut st,
                    EngineSyncStateUpdate {
                        cross_unsafe_head: Some(*block_ref),
                        ..Default::default()
                    },
                );
                let local_unsafe = st.sync_state.unsafe_head();
                drop(st);
                if let Some(handler) = &self.cross_update_handler {
                    handler.on_cross_unsafe_update(*block_ref, local_unsafe).await;
                }
            }
            Event::LocalSafeUpdate { block, source } => {
                // Pre-interop, everything that is local-safe is also immediately
                // cross-safe.
                if !self.cfg.is_interop_active(block.block_info.timestamp) {
                    self.promote_safe(*block, *source).await;
                }
            }
            Event::BuildStart { attributes } => self.on_build_start(attributes).await,
            Event::BuildStarted { payload_id, attributes, build_started } => {
                self.on_build_started(*payload_id, attributes, *build_started);
            }
            Event::BuildSeal { payload_id, attributes, build_started } => {
                self.on_build_seal(*payload_id, attributes, *build_started).await;
            }
            Event::BuildSealed { envelope, block_ref, attributes, build_started, .. } => {
                self.on_build_sealed(envelope, *block_ref, attributes, *build_started);
            }
            Event::BuildInvalid { attributes, reason } => {
                self.on_build_invalid(attributes, reason);
            }
            Event::BuildCancel { payload_id, timestamp } => {
                self.on_build_cancel(*payload_id, *timestamp).await;
            }
            Event::PayloadProcess { envelope, block_ref, concluding, derived_from, build_started } => {
                self.on_payload_process(envelope, *block_ref, *concluding, *derived_from, *build_started)
                    .await;
            }
            Event::PayloadSuccess { envelope: _, block_ref, concluding, derived_from } => {
                self.on_payload_success(*block_ref, *concluding, *derived_from).await;
            }
            Event::PayloadInvalid { envelope } => {
                warn!(
                    target: "engine",
                    hash = %envelope.execution_payload.block_hash(),
                    number = envelope.execution_payload.block_number(),
                    "Payload rejected by execution layer"
                );
            }
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use alloy_rpc_types_engine::{ForkchoiceUpdated, PayloadStatus};

    use super::*;
    use crate::test_utils::{
        MockEmitter, MockEngineClient, invalid_forkchoice_state_error, l2_block_at,
        payload_envelope_at, transport_error,
    };

    #[derive(Default)]
    struct CountingElSyncListener {
        count: AtomicUsize,
    }

    #[async_trait]
    impl ElSyncListener for CountingElSyncListener {
        async fn on_el_sync_started(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingPipelineResetter {
        count: AtomicUsize,
    }

    #[async_trait]
    impl PipelineResetter for CountingPipelineResetter {
        async fn reset_pipeline(&self) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingCrossHandler {
        cross_unsafe: Mutex<Vec<(L2BlockInfo, L2BlockInfo)>>,
        cross_safe: Mutex<Vec<(L2BlockInfo, L2BlockInfo)>>,
    }

    #[async_trait]
    impl CrossUpdateHandler for RecordingCrossHandler {
        async fn on_cross_unsafe_update(
            &self,
            cross_unsafe: L2BlockInfo,
            local_unsafe: L2BlockInfo,
        ) {
            self.cross_unsafe.lock().unwrap().push((cross_unsafe, local_unsafe));
        }

        async fn on_cross_safe_update(&self, cross_safe: L2BlockInfo, local_safe: L2BlockInfo) {
            self.cross_safe.lock().unwrap().push((cross_safe, local_safe));
        }
    }

    fn new_controller(
        client: &Arc<MockEngineClient>,
        emitter: &Arc<MockEmitter>,
        sync_mode: SyncMode,
    ) -> EngineController<MockEngineClient> {
        EngineController::new(
            client.clone(),
            Arc::new(RollupConfig::default()),
            SyncConfig { sync_mode, supports_post_finalization_el_sync: false },
            emitter.clone(),
        )
    }

    async fn seed(controller: &EngineController<MockEngineClient>, update: EngineSyncStateUpdate) {
        let mut st = controller.state.write().await;
        st.sync_state = st.sync_state.apply_update(update);
    }

    fn seed_all_heads(unsafe_head: u64, safe: u64, finalized: u64) -> EngineSyncStateUpdate {
        EngineSyncStateUpdate {
            unsafe_head: Some(l2_block_at(unsafe_head)),
            cross_unsafe_head: Some(l2_block_at(safe)),
            pending_safe_head: Some(l2_block_at(safe)),
            local_safe_head: Some(l2_block_at(safe)),
            safe_head: Some(l2_block_at(safe)),
            finalized_head: Some(l2_block_at(finalized)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_el_sync_starts_once() {
        let client = Arc::new(MockEngineClient::default());
        for _ in 0..2 {
            client.push_new_payload_response(Ok(PayloadStatus::from_status(
                PayloadStatusEnum::Syncing,
            )));
            client.push_fcu_response(Ok(ForkchoiceUpdated::from_status(
                PayloadStatusEnum::Syncing,
            )));
        }
        let emitter = Arc::new(MockEmitter::default());
        let listener = Arc::new(CountingElSyncListener::default());
        let mut controller = new_controller(&client, &emitter, SyncMode::ExecutionLayer);
        controller.set_el_sync_listener(listener.clone());

        controller.insert_unsafe_payload(payload_envelope_at(1), l2_block_at(1)).await.unwrap();
        assert_eq!(controller.sync_status().await, SyncStatus::StartedEl);
        controller.insert_unsafe_payload(payload_envelope_at(2), l2_block_at(2)).await.unwrap();
        assert_eq!(controller.sync_status().await, SyncStatus::StartedEl);
        assert_eq!(listener.count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_el_sync_skipped_when_chain_is_finalized() {
        let client = Arc::new(MockEngineClient::default());
        client.insert_block_by_label(BlockNumberOrTag::Finalized, l2_block_at(5));
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ExecutionLayer);

        controller.insert_unsafe_payload(payload_envelope_at(6), l2_block_at(6)).await.unwrap();

        // The payload is skipped entirely; CL sync picks it up again.
        assert_eq!(controller.sync_status().await, SyncStatus::FinishedEl);
        assert_eq!(client.new_payload_call_count(), 0);
        assert_eq!(controller.unsafe_head().await, L2BlockInfo::default());
    }

    #[tokio::test]
    async fn test_el_sync_finishes_on_valid_payload() {
        let client = Arc::new(MockEngineClient::default());
        client.push_new_payload_response(Ok(PayloadStatus::from_status(
            PayloadStatusEnum::Syncing,
        )));
        client.push_fcu_response(Ok(ForkchoiceUpdated::from_status(PayloadStatusEnum::Syncing)));
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ExecutionLayer);

        controller.insert_unsafe_payload(payload_envelope_at(1), l2_block_at(1)).await.unwrap();
        assert_eq!(controller.sync_status().await, SyncStatus::StartedEl);

        // A valid payload response means the EL caught up; the inserted tip becomes
        // the safe and finalized head.
        controller.insert_unsafe_payload(payload_envelope_at(2), l2_block_at(2)).await.unwrap();
        assert_eq!(controller.sync_status().await, SyncStatus::FinishedEl);
        assert_eq!(controller.unsafe_head().await, l2_block_at(2));
        assert_eq!(controller.safe_head().await, l2_block_at(2));
        assert_eq!(controller.finalized_head().await, l2_block_at(2));

        let (fc, _) = client.last_fcu_call().unwrap();
        assert_eq!(fc.head_block_hash, l2_block_at(2).block_info.hash);
        assert_eq!(fc.safe_block_hash, l2_block_at(2).block_info.hash);
        assert_eq!(fc.finalized_block_hash, l2_block_at(2).block_info.hash);
    }

    #[tokio::test]
    async fn test_invalid_forkchoice_state_requires_reset() {
        let client = Arc::new(MockEngineClient::default());
        client.push_fcu_response(Err(invalid_forkchoice_state_error()));
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(5, 3, 2)).await;

        let err = controller.try_update_engine().await.unwrap_err();
        assert_eq!(err.severity(), ErrorSeverity::Reset);

        // Heads are untouched and the update is still owed.
        assert_eq!(controller.unsafe_head().await, l2_block_at(5));
        assert!(controller.state.read().await.forkchoice_update_needed);
    }

    #[tokio::test]
    async fn test_unsafe_behind_finalized_is_critical() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(1, 1, 2)).await;

        let err = controller.try_update_engine().await.unwrap_err();
        assert!(matches!(err, EngineControllerError::FinalizedAheadOfUnsafe { .. }));
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(client.fcu_call_count(), 0);
    }

    #[tokio::test]
    async fn test_try_update_engine_is_noop_without_pending_update() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(5, 3, 2)).await;

        controller.try_update_engine().await.unwrap();
        assert_eq!(client.fcu_call_count(), 1);
        assert!(emitter.events().iter().any(|e| matches!(e, Event::ForkchoiceUpdate { .. })));

        controller.try_update_engine().await.unwrap();
        assert_eq!(client.fcu_call_count(), 1);
    }

    #[tokio::test]
    async fn test_promote_finalized_guards() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(6, 5, 3)).await;

        // Finality cannot rewind.
        controller.promote_finalized(l2_block_at(2)).await;
        assert_eq!(controller.finalized_head().await, l2_block_at(3));

        // A block must be safe before it can be finalized.
        controller.promote_finalized(l2_block_at(6)).await;
        assert_eq!(controller.finalized_head().await, l2_block_at(3));
        assert!(!emitter.events().iter().any(|e| matches!(e, Event::FinalizedUpdate(_))));

        controller.promote_finalized(l2_block_at(4)).await;
        assert_eq!(controller.finalized_head().await, l2_block_at(4));
        assert!(
            emitter
                .events()
                .iter()
                .any(|e| matches!(e, Event::FinalizedUpdate(b) if *b == l2_block_at(4)))
        );
    }

    #[tokio::test]
    async fn test_try_update_unsafe_snapshots_backup_on_reorg() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(5, 3, 2)).await;

        // Extending the chain leaves no backup behind.
        controller.try_update_unsafe(l2_block_at(6)).await;
        assert_eq!(controller.unsafe_head().await, l2_block_at(6));
        assert_eq!(controller.backup_unsafe_head().await, L2BlockInfo::default());

        // Rewinding to an equal-or-lower height snapshots the replaced head.
        controller.try_update_unsafe(l2_block_at(4)).await;
        assert_eq!(controller.unsafe_head().await, l2_block_at(4));
        assert_eq!(controller.backup_unsafe_head().await, l2_block_at(6));
    }

    #[tokio::test]
    async fn test_try_update_pending_safe_is_monotonic() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(8, 5, 2)).await;

        controller.try_update_pending_safe(l2_block_at(4), true).await;
        assert_eq!(controller.pending_safe_head().await, l2_block_at(5));
        assert!(!emitter.events().iter().any(|e| matches!(e, Event::PendingSafeUpdate { .. })));

        controller.try_update_pending_safe(l2_block_at(6), true).await;
        assert_eq!(controller.pending_safe_head().await, l2_block_at(6));
        assert!(emitter.events().iter().any(|e| matches!(e, Event::PendingSafeUpdate { .. })));
    }

    #[tokio::test]
    async fn test_try_update_local_safe_requires_concluding_block() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(8, 5, 2)).await;

        controller.try_update_local_safe(l2_block_at(6), false, BlockInfo::default()).await;
        assert_eq!(controller.local_safe_head().await, l2_block_at(5));

        controller.try_update_local_safe(l2_block_at(6), true, BlockInfo::default()).await;
        assert_eq!(controller.local_safe_head().await, l2_block_at(6));
        assert!(emitter.events().iter().any(|e| matches!(e, Event::LocalSafeUpdate { .. })));
    }

    #[tokio::test]
    async fn test_promote_safe_pulls_stale_cross_unsafe_along() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let handler = Arc::new(RecordingCrossHandler::default());
        let mut controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        controller.set_cross_update_handler(handler.clone());
        seed(&controller, seed_all_heads(6, 2, 1)).await;

        controller.promote_safe(l2_block_at(4), BlockInfo::default()).await;

        assert_eq!(controller.safe_head().await, l2_block_at(4));
        assert_eq!(controller.cross_unsafe_head().await, l2_block_at(4));
        assert!(emitter.events().iter().any(|e| matches!(e, Event::SafeDerived { .. })));
        assert_eq!(*handler.cross_safe.lock().unwrap(), vec![(l2_block_at(4), l2_block_at(2))]);
        assert_eq!(*handler.cross_unsafe.lock().unwrap(), vec![(l2_block_at(4), l2_block_at(6))]);
    }

    #[tokio::test]
    async fn test_force_reset_overwrites_heads_and_confirms() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let resetter = Arc::new(CountingPipelineResetter::default());
        let mut controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        controller.set_pipeline_resetter(resetter.clone());
        seed(&controller, seed_all_heads(20, 15, 10)).await;
        seed(
            &controller,
            EngineSyncStateUpdate {
                backup_unsafe_head: Some(l2_block_at(21)),
                ..Default::default()
            },
        )
        .await;

        controller
            .force_reset(l2_block_at(8), l2_block_at(7), l2_block_at(6), l2_block_at(5), l2_block_at(4))
            .await;

        assert_eq!(controller.unsafe_head().await, l2_block_at(8));
        assert_eq!(controller.cross_unsafe_head().await, l2_block_at(7));
        assert_eq!(controller.local_safe_head().await, l2_block_at(6));
        // The pending safe head adopts the local safe head.
        assert_eq!(controller.pending_safe_head().await, l2_block_at(6));
        assert_eq!(controller.safe_head().await, l2_block_at(5));
        assert_eq!(controller.finalized_head().await, l2_block_at(4));
        assert_eq!(controller.backup_unsafe_head().await, L2BlockInfo::default());
        assert_eq!(resetter.count.load(Ordering::SeqCst), 1);
        assert!(emitter.events().iter().any(|e| matches!(e, Event::ConfirmPipelineReset)));
        assert!(
            emitter
                .events()
                .iter()
                .any(|e| matches!(e, Event::EngineResetConfirmed { local_unsafe, .. } if *local_unsafe == l2_block_at(8)))
        );
    }

    #[tokio::test]
    async fn test_backup_reorg_noop_when_not_armed() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);

        assert!(!controller.try_backup_unsafe_reorg().await.unwrap());
        assert_eq!(client.fcu_call_count(), 0);
    }

    #[tokio::test]
    async fn test_backup_reorg_restores_unsafe_head() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(4, 3, 2)).await;
        seed(
            &controller,
            EngineSyncStateUpdate {
                backup_unsafe_head: Some(l2_block_at(6)),
                ..Default::default()
            },
        )
        .await;
        controller.state.write().await.backup_unsafe_reorg_needed = true;

        assert!(controller.try_backup_unsafe_reorg().await.unwrap());
        assert_eq!(controller.unsafe_head().await, l2_block_at(6));
        assert_eq!(controller.backup_unsafe_head().await, L2BlockInfo::default());
        assert!(!controller.state.read().await.backup_unsafe_reorg_needed);
    }

    #[tokio::test]
    async fn test_backup_reorg_drops_backup_on_reset_error() {
        let client = Arc::new(MockEngineClient::default());
        client.push_fcu_response(Err(invalid_forkchoice_state_error()));
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(4, 3, 2)).await;
        seed(
            &controller,
            EngineSyncStateUpdate {
                backup_unsafe_head: Some(l2_block_at(6)),
                ..Default::default()
            },
        )
        .await;
        controller.state.write().await.backup_unsafe_reorg_needed = true;

        let err = controller.try_backup_unsafe_reorg().await.unwrap_err();
        assert_eq!(err.severity(), ErrorSeverity::Reset);
        // The engine forgot the backup head; it is gone for good.
        assert_eq!(controller.backup_unsafe_head().await, L2BlockInfo::default());
        assert!(!controller.state.read().await.backup_unsafe_reorg_needed);
    }

    #[tokio::test]
    async fn test_backup_reorg_rearms_on_transport_error() {
        let client = Arc::new(MockEngineClient::default());
        client.push_fcu_response(Err(transport_error()));
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(4, 3, 2)).await;
        seed(
            &controller,
            EngineSyncStateUpdate {
                backup_unsafe_head: Some(l2_block_at(6)),
                ..Default::default()
            },
        )
        .await;
        controller.state.write().await.backup_unsafe_reorg_needed = true;

        let err = controller.try_backup_unsafe_reorg().await.unwrap_err();
        assert_eq!(err.severity(), ErrorSeverity::Temporary);
        assert_eq!(controller.backup_unsafe_head().await, l2_block_at(6));
        assert!(controller.state.read().await.backup_unsafe_reorg_needed);
    }

    #[tokio::test]
    async fn test_payload_success_promotes_derived_blocks() {
        let client = Arc::new(MockEngineClient::default());
        let emitter = Arc::new(MockEmitter::default());
        let controller = new_controller(&client, &emitter, SyncMode::ConsensusLayer);
        seed(&controller, seed_all_heads(5, 3, 2)).await;

        let recognized = controller
            .on_event(&Event::PayloadSuccess {
                envelope: payload_envelope_at(6),
                block_ref: l2_block_at(6),
                concluding: true,
                derived_from: Some(BlockInfo::default()),
            })
            .await;

        assert!(recognized);
        assert_eq!(controller.unsafe_head().await, l2_block_at(6));
        assert_eq!(controller.pending_safe_head().await, l2_block_at(6));
        assert_eq!(controller.local_safe_head().await, l2_block_at(6));
        assert!(client.fcu_call_count() >= 1);
    }
}
