//! Engine API version selection based on hardfork activation.

use kona_genesis::RollupConfig;

/// The version of the `engine_forkchoiceUpdated` method to use, based on the
/// timestamp the call concerns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineForkchoiceVersion {
    /// Version 2 of the `engine_forkchoiceUpdated` method, used before Ecotone.
    V2,
    /// Version 3 of the `engine_forkchoiceUpdated` method, used from Ecotone onwards.
    V3,
}

impl EngineForkchoiceVersion {
    /// Returns the appropriate version for the chain at the given timestamp.
    pub fn from_cfg(cfg: &RollupConfig, timestamp: u64) -> Self {
        if cfg.is_ecotone_active(timestamp) { Self::V3 } else { Self::V2 }
    }
}

/// The version of the `engine_getPayload` method to use, based on the payload timestamp.
///
/// `engine_newPayload` needs no counterpart: the payload envelope variant already
/// determines the method version there.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EngineGetPayloadVersion {
    /// Version 2 of the `engine_getPayload` method.
    V2,
    /// Version 3 of the `engine_getPayload` method, used from Ecotone onwards.
    V3,
    /// Version 4 of the `engine_getPayload` method, used from Isthmus onwards.
    V4,
}

impl EngineGetPayloadVersion {
    /// Returns the appropriate version for the chain at the given timestamp.
    pub fn from_cfg(cfg: &RollupConfig, timestamp: u64) -> Self {
        if cfg.is_isthmus_active(timestamp) {
            Self::V4
        } else if cfg.is_ecotone_active(timestamp) {
            Self::V3
        } else {
            Self::V2
        }
    }
}

#[cfg(test)]
mod tests {
    use kona_genesis::HardForkConfig;
    use rstest::rstest;

    use super::*;

    fn cfg() -> RollupConfig {
        RollupConfig {
            hardforks: HardForkConfig {
                ecotone_time: Some(10),
                isthmus_time: Some(20),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[rstest]
    #[case::pre_ecotone(5, EngineForkchoiceVersion::V2)]
    #[case::ecotone(10, EngineForkchoiceVersion::V3)]
    #[case::post_isthmus(25, EngineForkchoiceVersion::V3)]
    fn test_forkchoice_version(#[case] timestamp: u64, #[case] expected: EngineForkchoiceVersion) {
        assert_eq!(EngineForkchoiceVersion::from_cfg(&cfg(), timestamp), expected);
    }

    #[rstest]
    #[case::pre_ecotone(5, EngineGetPayloadVersion::V2)]
    #[case::ecotone(15, EngineGetPayloadVersion::V3)]
    #[case::isthmus(25, EngineGetPayloadVersion::V4)]
    fn test_get_payload_version(#[case] timestamp: u64, #[case] expected: EngineGetPayloadVersion) {
        assert_eq!(EngineGetPayloadVersion::from_cfg(&cfg(), timestamp), expected);
    }
}
