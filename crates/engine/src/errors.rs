//! Error types for the engine controller.

use alloy_rpc_types_engine::{INVALID_FORK_CHOICE_STATE_ERROR, PayloadStatusEnum};
use alloy_transport::{RpcError, TransportErrorKind};
use kona_protocol::FromBlockError;
use thiserror::Error;

use crate::EngineClientError;

/// How the rest of the node should react to an [`EngineControllerError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// The error is transient; retrying the operation later is expected to succeed.
    Temporary,
    /// The node's forkchoice state is inconsistent with the execution layer and an
    /// engine reset is required to resolve it.
    Reset,
    /// An invariant was violated; the node cannot make progress and should exit.
    Critical,
}

/// An error that occurred while driving the execution layer through the Engine API.
#[derive(Error, Debug)]
pub enum EngineControllerError {
    /// The engine rejected the forkchoice state as inconsistent (error code -38002).
    #[error("forkchoice update was inconsistent with engine, need reset to resolve: {0}")]
    InvalidForkchoiceState(RpcError<TransportErrorKind>),

    /// The `engine_forkchoiceUpdated` call failed on the transport level.
    #[error("failed to sync forkchoice with engine: {0}")]
    ForkchoiceUpdateFailed(RpcError<TransportErrorKind>),

    /// The `engine_newPayload` call failed on the transport level.
    #[error("failed to insert payload: {0}")]
    NewPayloadFailed(RpcError<TransportErrorKind>),

    /// The engine returned a payload status the operation cannot accept.
    #[error("unexpected payload status: {0}")]
    UnexpectedPayloadStatus(PayloadStatusEnum),

    /// A head could not be loaded from the execution layer.
    #[error("failed to load {label} head: {source}")]
    HeadLookup {
        /// The head label that was queried.
        label: &'static str,
        /// The underlying client error.
        source: EngineClientError,
    },

    /// A block the controller relies on is not known to the execution layer.
    #[error("no block found for {0} head")]
    MissingBlock(&'static str),

    /// The unsafe head fell behind the finalized head; the state is corrupt.
    #[error("invalid forkchoice state, unsafe head {unsafe_number} is behind finalized head {finalized_number}")]
    FinalizedAheadOfUnsafe {
        /// The unsafe head block number.
        unsafe_number: u64,
        /// The finalized head block number.
        finalized_number: u64,
    },

    /// An L2 block ref could not be constructed from a payload.
    #[error("failed to derive block ref from payload: {0}")]
    BlockInfoConstruction(#[from] FromBlockError),
}

impl EngineControllerError {
    /// Classifies an `engine_forkchoiceUpdated` RPC failure. An invalid-forkchoice-state
    /// error response requires an engine reset; everything else is transient.
    pub fn from_fcu_rpc_error(err: RpcError<TransportErrorKind>) -> Self {
        let invalid_fc = err
            .as_error_resp()
            .is_some_and(|resp| resp.code == INVALID_FORK_CHOICE_STATE_ERROR as i64);
        if invalid_fc { Self::InvalidForkchoiceState(err) } else { Self::ForkchoiceUpdateFailed(err) }
    }

    /// Returns the [`ErrorSeverity`] of the error.
    pub const fn severity(&self) -> ErrorSeverity {
        match self {
            Self::InvalidForkchoiceState(_) => ErrorSeverity::Reset,
            Self::FinalizedAheadOfUnsafe { .. } | Self::BlockInfoConstruction(_) => {
                ErrorSeverity::Critical
            }
            Self::ForkchoiceUpdateFailed(_)
            | Self::NewPayloadFailed(_)
            | Self::UnexpectedPayloadStatus(_)
            | Self::HeadLookup { .. }
            | Self::MissingBlock(_) => ErrorSeverity::Temporary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{invalid_forkchoice_state_error, transport_error};

    #[test]
    fn test_invalid_forkchoice_state_is_reset() {
        let err = EngineControllerError::from_fcu_rpc_error(invalid_forkchoice_state_error());
        assert!(matches!(err, EngineControllerError::InvalidForkchoiceState(_)));
        assert_eq!(err.severity(), ErrorSeverity::Reset);
    }

    #[test]
    fn test_other_rpc_errors_are_temporary() {
        let err = EngineControllerError::from_fcu_rpc_error(transport_error());
        assert!(matches!(err, EngineControllerError::ForkchoiceUpdateFailed(_)));
        assert_eq!(err.severity(), ErrorSeverity::Temporary);
    }

    #[test]
    fn test_state_violations_are_critical() {
        let err =
            EngineControllerError::FinalizedAheadOfUnsafe { unsafe_number: 1, finalized_number: 2 };
        assert_eq!(err.severity(), ErrorSeverity::Critical);
    }
}
