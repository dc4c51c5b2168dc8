//! Packing strategies: the policy layer that decides which pending
//!  application messages go into which tick's datagram, and how they are
//!  serialized.
//!
//! All strategies share one contract. `add` enqueues a message under the
//!  strategy's own semantics (append, merge, supersede-by-key). Once per tick,
//!  `process` inspects the pending entries and appends the ones that are due
//!  to the tick's block map, consuming exactly as much of the byte budget as
//!  it adds - including the 3-byte per-block overhead the first time a block
//!  id appears in this tick's output. `ack` releases every entry that was
//!  embedded in the acknowledged datagram.
//!
//! Retransmission grouping is the invariant that makes receive-side
//!  deduplication work: an entry is always embedded under the sequence id of
//!  its *first* transmission, so however many datagrams carry it, the peer
//!  sees the same `(block id, packet counter)` pair.

mod merge;
mod most_recent;
mod ordered;
mod unique_merge;

pub use merge::MergePacker;
pub use most_recent::{ById, ByOpcode, MostRecentPacker, MostRecentPackerById, MostRecentPackerByOpcode, PacketKey};
pub use ordered::OrderedPacker;
pub use unique_merge::UniqueMergePacker;

use crate::packet::Packet;
use crate::seq;
use std::collections::BTreeMap;

/// packets due this tick, grouped by the block id they will be labeled with
pub type BlockMap = BTreeMap<u16, Vec<Packet>>;

/// per-block cost on the wire: block id (u16) + packet count (u8)
pub const BLOCK_OVERHEAD: usize = 3;

pub trait Packer {
    type Message;

    fn add(&mut self, message: Self::Message);

    /// Append every entry due at `tick_id` to `blocks`, decrementing
    ///  `remaining` by exactly the bytes this will add to the datagram.
    fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap);

    /// Release every entry that was embedded in the datagram `block_id`.
    fn ack(&mut self, block_id: u16);

    /// Drop all pending entries unconditionally (reconnection, or a
    ///  fire-and-forget queue flushing after its tick).
    fn clear(&mut self);

    /// Drop entries that have been transmitted more than `max_retries` times
    ///  without an acknowledgement.
    fn drop_exhausted(&mut self, max_retries: usize);
}

/// the additional budget needed to place a packet under `block_id`
pub(crate) fn block_cost(blocks: &BlockMap, block_id: u16) -> usize {
    if blocks.contains_key(&block_id) {
        0
    } else {
        BLOCK_OVERHEAD
    }
}

/// An entry is due when it has never been sent, or its last transmission is
///  at least `resend_threshold` ticks old.
pub(crate) fn is_due(transmissions: &[u16], tick_id: u16, resend_threshold: u16) -> bool {
    match transmissions.last() {
        None => true,
        Some(&last) => seq::sub(tick_id, last) >= resend_threshold,
    }
}

pub(crate) fn sent_this_tick(transmissions: &[u16], tick_id: u16) -> bool {
    transmissions.last() == Some(&tick_id)
}

/// the block id an entry is labeled with: its first transmission, or the
///  current tick for a brand-new entry
pub(crate) fn carrier_block(transmissions: &[u16], tick_id: u16) -> u16 {
    transmissions.first().copied().unwrap_or(tick_id)
}
