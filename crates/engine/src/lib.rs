//! Engine API controller for an OP Stack rollup node.
//!
//! This crate drives an execution-layer client through the Engine API. The
//! [`EngineController`] owns the node's view of the L2 head state across all
//! safety levels and reconciles it with the execution layer via
//! `engine_forkchoiceUpdated` and `engine_newPayload` calls. Work arrives as
//! [`Event`]s dispatched by the [`EventSystem`]; handlers emit follow-up
//! events rather than calling each other directly.
//!
//! ## Module Organization
//!
//! - **Controller** - Head-state bookkeeping and Engine API orchestration via
//!   [`EngineController`]
//! - **Client** - HTTP client for Engine API communication via [`EngineClient`]
//! - **Events** - Typed event vocabulary and serialized dispatch via [`Event`] and
//!   [`EventSystem`]
//! - **State** - Head state across safety levels via [`EngineState`]
//! - **Sync** - Sync mode, configuration and EL-sync status via [`SyncStatus`]
//! - **Reset** - Sync-start search and engine reset via [`find_starting_forkchoice`] and
//!   [`EngineResetDeriver`]
//! - **Versions** - Engine API version selection via [`EngineForkchoiceVersion`] and
//!   [`EngineGetPayloadVersion`]
//! - **Metrics** - Prometheus metrics collection via [`Metrics`]

#[macro_use]
extern crate tracing;

mod attributes;
pub use attributes::AttributesWithParent;

mod client;
pub use client::{
    EngineClient, EngineClientBuilder, EngineClientError, HttpEngineClient, HyperAuthClient,
};

mod controller;
pub use controller::{
    AttributesResetter, CrossUpdateHandler, ElSyncListener, EngineController, ForkchoiceRequester,
    OriginSelectorResetter, PipelineResetter,
};

mod errors;
pub use errors::{EngineControllerError, ErrorSeverity};

mod events;
pub use events::{Event, EventEmitter, EventHandler, EventSender, EventSystem};

mod metrics;
pub use metrics::Metrics;

mod reset;
pub use reset::{EngineResetDeriver, L2ForkchoiceState, SyncStartError, find_starting_forkchoice};

mod state;
pub use state::{EngineState, EngineSyncState, EngineSyncStateUpdate};

mod sync;
pub use sync::{SyncConfig, SyncMode, SyncStatus};

mod versions;
pub use versions::{EngineForkchoiceVersion, EngineGetPayloadVersion};

mod build;
mod payload;

#[cfg(any(test, feature = "test-utils"))]
/// Utilities that are useful when creating unit tests using structs within this library.
pub mod test_utils;
