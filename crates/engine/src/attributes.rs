//! Payload attributes paired with the parent block they build on.

use kona_protocol::{BlockInfo, L2BlockInfo};
use op_alloy_consensus::OpTxType;
use op_alloy_rpc_types_engine::OpPayloadAttributes;

/// [`OpPayloadAttributes`] plus the context the engine needs to build and track the
/// block: the parent to build on, the L1 block the attributes were derived from
/// (if any), and whether the block concludes its span-batch.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributesWithParent {
    /// The payload attributes to build.
    pub attributes: OpPayloadAttributes,
    /// The parent block to build on top of.
    pub parent: L2BlockInfo,
    /// The L1 block these attributes were derived from. `None` for
    /// sequencer-created attributes.
    pub derived_from: Option<BlockInfo>,
    /// Whether the block built from these attributes concludes its span-batch.
    pub concluding: bool,
}

impl AttributesWithParent {
    /// Creates a new [`AttributesWithParent`].
    pub const fn new(
        attributes: OpPayloadAttributes,
        parent: L2BlockInfo,
        derived_from: Option<BlockInfo>,
        concluding: bool,
    ) -> Self {
        Self { attributes, parent, derived_from, concluding }
    }

    /// Whether the attributes were derived from L1 data.
    pub const fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    /// Whether the attributes contain deposit transactions only.
    pub fn is_deposits_only(&self) -> bool {
        self.attributes
            .transactions
            .as_ref()
            .is_some_and(|txs| txs.iter().all(|tx| tx.first() == Some(&(OpTxType::Deposit as u8))))
    }

    /// Returns a copy of the attributes stripped down to its deposit transactions,
    /// with the transaction pool disabled. Used for the Holocene invalid-payload
    /// fallback.
    pub fn as_deposits_only(&self) -> Self {
        Self {
            attributes: OpPayloadAttributes {
                transactions: self.attributes.transactions.as_ref().map(|txs| {
                    txs.iter()
                        .filter(|tx| tx.first() == Some(&(OpTxType::Deposit as u8)))
                        .cloned()
                        .collect()
                }),
                no_tx_pool: Some(true),
                ..self.attributes.clone()
            },
            parent: self.parent,
            derived_from: self.derived_from,
            concluding: self.concluding,
        }
    }
}
