//! A bounded buffer for unsafe payloads received ahead of the unsafe head.

use std::{cmp::Reverse, collections::BinaryHeap, sync::Arc};

use op_alloy_rpc_types_engine::{OpExecutionPayload, OpExecutionPayloadEnvelope};
use thiserror::Error;

/// Memory budget for buffered unsafe payloads.
pub(crate) const MAX_UNSAFE_PAYLOADS_MEMORY: u64 = 500 * 1024 * 1024;

/// Rough per-payload bookkeeping overhead, on top of the transaction bytes.
const PAYLOAD_MEM_FIXED_COST: u64 = 1000;

/// Rough per-transaction bookkeeping overhead.
const PAYLOAD_TX_MEM_OVERHEAD: u64 = 24;

/// An error pushing a payload into the [`PayloadsQueue`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadsQueueError {
    /// Adding the payload would exceed the queue's memory budget.
    #[error("unsafe payload queue is full, {used} bytes used of {budget}, payload needs {payload}")]
    QueueFull {
        /// Bytes currently accounted for.
        used: u64,
        /// The size of the rejected payload.
        payload: u64,
        /// The queue's memory budget.
        budget: u64,
    },
}

/// Estimates the memory a buffered payload occupies. Only the transaction bytes are
/// counted exactly; everything else is a flat overhead.
fn payload_mem_size(payload: &OpExecutionPayload) -> u64 {
    let transactions = match payload {
        OpExecutionPayload::V1(p) => &p.transactions,
        OpExecutionPayload::V2(p) => &p.payload_inner.transactions,
        OpExecutionPayload::V3(p) => &p.payload_inner.payload_inner.transactions,
        OpExecutionPayload::V4(p) => &p.payload_inner.payload_inner.payload_inner.transactions,
    };
    transactions
        .iter()
        .fold(PAYLOAD_MEM_FIXED_COST, |acc, tx| acc + tx.len() as u64 + PAYLOAD_TX_MEM_OVERHEAD)
}

#[derive(Debug)]
struct QueueEntry {
    envelope: Arc<OpExecutionPayloadEnvelope>,
    block_number: u64,
    mem_size: u64,
    /// Insertion order, to keep equal-height payloads first-in-first-out.
    seq: u64,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.block_number == other.block_number && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.block_number, self.seq).cmp(&(other.block_number, other.seq))
    }
}

/// A priority queue of unsafe payloads, lowest block number first.
///
/// Payloads may arrive out of order from the network; the queue absorbs the jitter so
/// the engine only ever sees the next applicable block. Entries are never evicted to
/// make room: a full queue rejects new payloads, and entries leave only once applied,
/// invalidated, or overtaken by the unsafe head.
#[derive(Debug)]
pub struct PayloadsQueue {
    heap: BinaryHeap<Reverse<QueueEntry>>,
    current_size: u64,
    max_size: u64,
    next_seq: u64,
}

impl Default for PayloadsQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadsQueue {
    /// Creates a queue with the default memory budget.
    pub fn new() -> Self {
        Self::with_max_size(MAX_UNSAFE_PAYLOADS_MEMORY)
    }

    pub(crate) fn with_max_size(max_size: u64) -> Self {
        Self { heap: BinaryHeap::new(), current_size: 0, max_size, next_seq: 0 }
    }

    /// Number of buffered payloads.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Estimated memory held by the buffered payloads.
    pub fn mem_size(&self) -> u64 {
        self.current_size
    }

    /// Buffers a payload, erroring if it does not fit the memory budget.
    pub fn push(
        &mut self,
        envelope: Arc<OpExecutionPayloadEnvelope>,
    ) -> Result<(), PayloadsQueueError> {
        let mem_size = payload_mem_size(&envelope.execution_payload);
        if self.current_size + mem_size > self.max_size {
            return Err(PayloadsQueueError::QueueFull {
                used: self.current_size,
                payload: mem_size,
                budget: self.max_size,
            });
        }
        let block_number = envelope.execution_payload.block_number();
        self.heap.push(Reverse(QueueEntry {
            envelope,
            block_number,
            mem_size,
            seq: self.next_seq,
        }));
        self.next_seq += 1;
        self.current_size += mem_size;
        Ok(())
    }

    /// The lowest buffered payload, without removing it.
    pub fn peek(&self) -> Option<&Arc<OpExecutionPayloadEnvelope>> {
        self.heap.peek().map(|Reverse(entry)| &entry.envelope)
    }

    /// Removes and returns the lowest buffered payload.
    pub fn pop(&mut self) -> Option<Arc<OpExecutionPayloadEnvelope>> {
        self.heap.pop().map(|Reverse(entry)| {
            self.current_size -= entry.mem_size;
            entry.envelope
        })
    }

    /// Drops every payload at or below the given unsafe head height; those can never be
    /// applied anymore.
    pub fn drop_inapplicable(&mut self, unsafe_head_number: u64) {
        while self.heap.peek().is_some_and(|Reverse(entry)| entry.block_number <= unsafe_head_number)
        {
            self.pop();
        }
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Bytes;
    use rollup_engine::test_utils::{payload_envelope, payload_envelope_at};

    use super::*;

    #[test]
    fn test_pop_orders_by_block_number() {
        let mut queue = PayloadsQueue::new();
        queue.push(payload_envelope_at(3)).unwrap();
        queue.push(payload_envelope_at(1)).unwrap();
        queue.push(payload_envelope_at(2)).unwrap();

        assert_eq!(queue.pop().unwrap().execution_payload.block_number(), 1);
        assert_eq!(queue.pop().unwrap().execution_payload.block_number(), 2);
        assert_eq!(queue.pop().unwrap().execution_payload.block_number(), 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_equal_heights_pop_in_arrival_order() {
        let first = payload_envelope(5, vec![Bytes::from(vec![0x01])]);
        let second = payload_envelope(5, vec![Bytes::from(vec![0x02])]);

        let mut queue = PayloadsQueue::new();
        queue.push(first.clone()).unwrap();
        queue.push(second.clone()).unwrap();

        assert_eq!(queue.pop().unwrap(), first);
        assert_eq!(queue.pop().unwrap(), second);
    }

    #[test]
    fn test_full_queue_rejects_instead_of_evicting() {
        // Budget fits exactly one empty payload.
        let mut queue = PayloadsQueue::with_max_size(PAYLOAD_MEM_FIXED_COST);
        queue.push(payload_envelope_at(1)).unwrap();

        let err = queue.push(payload_envelope_at(2)).unwrap_err();
        assert!(matches!(err, PayloadsQueueError::QueueFull { .. }));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().execution_payload.block_number(), 1);
    }

    #[test]
    fn test_mem_accounting_tracks_transactions() {
        let mut queue = PayloadsQueue::new();
        queue.push(payload_envelope(1, vec![Bytes::from(vec![0u8; 100])])).unwrap();
        assert_eq!(queue.mem_size(), PAYLOAD_MEM_FIXED_COST + 100 + PAYLOAD_TX_MEM_OVERHEAD);

        queue.pop();
        assert_eq!(queue.mem_size(), 0);
    }

    #[rstest::rstest]
    #[case::head_behind_queue(0, 3, Some(1))]
    #[case::head_mid_queue(2, 1, Some(4))]
    #[case::head_past_queue(5, 0, None)]
    fn test_drop_inapplicable_removes_stale_payloads(
        #[case] unsafe_head: u64,
        #[case] remaining: usize,
        #[case] next: Option<u64>,
    ) {
        let mut queue = PayloadsQueue::new();
        for number in [1, 2, 4] {
            queue.push(payload_envelope_at(number)).unwrap();
        }

        queue.drop_inapplicable(unsafe_head);
        assert_eq!(queue.len(), remaining);
        assert_eq!(queue.peek().map(|e| e.execution_payload.block_number()), next);
    }
}
