//! The per-tick outgoing datagram assembler for one connection.
//!
//! Each tick, [`finish`](SuperPacket::finish) reserves the fixed header,
//!  flushes the pending acknowledgements, lets every queue fill the remaining
//!  byte budget in priority order (unreliable first, then reliable-immediate,
//!  then reliable-ordered) and stamps the total length. The sequence id then
//!  advances by exactly one - always, even when nothing was written - so the
//!  id space counts ticks, not datagrams put on the wire.

use crate::buffers::ArrayBuf;
use crate::config::ProtocolConfig;
use crate::packers::{BlockMap, MergePacker, MostRecentPacker, MostRecentPackerById, OrderedPacker};
use crate::packet::Packet;
use crate::packet_pool::PacketPool;
use crate::queues::{ReliableQueue, UnreliableQueue};
use crate::seq;
use bytes::BufMut;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// hard upper bound for one datagram
pub const MAX_DATAGRAM_SIZE: usize = 512;

/// budget ceiling for header, acks and blocks together
pub const USABLE_DATAGRAM_SIZE: usize = 500;

/// acknowledgements carried per datagram at most; overflow is dropped and the
///  peer simply retransmits
const MAX_ACKS_PER_DATAGRAM: usize = 64;

const LENGTH_OFFSET: usize = 0;

pub struct SuperPacket {
    tick_id: u16,
    pending_acks: Vec<u16>,
    unreliable: UnreliableQueue<MergePacker>,
    immediate: ReliableQueue<MostRecentPackerById>,
    ordered: ReliableQueue<OrderedPacker>,
    buffer: ArrayBuf<MAX_DATAGRAM_SIZE>,
}

impl SuperPacket {
    pub fn new(config: &Arc<ProtocolConfig>, pool: &Arc<PacketPool>) -> SuperPacket {
        SuperPacket {
            tick_id: 0,
            pending_acks: Vec::new(),
            unreliable: UnreliableQueue::new(
                MergePacker::new(Arc::clone(pool)),
                config.max_unreliable_retries,
            ),
            immediate: ReliableQueue::new(MostRecentPacker::new(Arc::clone(config))),
            ordered: ReliableQueue::new(OrderedPacker::new(Arc::clone(config))),
            buffer: ArrayBuf::new(),
        }
    }

    /// the sequence id the next call to [`finish`](SuperPacket::finish) will use
    pub fn peek_id(&self) -> u16 {
        self.tick_id
    }

    /// Enqueue a fire-and-forget record, merged with its siblings into one
    ///  shared packet.
    pub fn send_unreliable(&mut self, opcode: u16, data: Vec<u8>) {
        self.unreliable.add((opcode, data));
    }

    /// Enqueue a reliable latest-value packet, keyed by its application id:
    ///  a newer packet for the same id supersedes an unacknowledged older one.
    pub fn send_immediate(&mut self, packet: Packet) {
        self.immediate.add(packet);
    }

    /// Enqueue a reliable packet delivered in enqueue order relative to its
    ///  queue siblings.
    pub fn send_ordered(&mut self, packet: Packet) {
        self.ordered.add(packet);
    }

    /// Note that the peer's datagram `tick_id` carried data and must be
    ///  acknowledged with the next outgoing datagram.
    pub fn schedule_ack(&mut self, tick_id: u16) {
        if self.pending_acks.contains(&tick_id) {
            return;
        }
        if self.pending_acks.len() == MAX_ACKS_PER_DATAGRAM {
            warn!("dropping acknowledgement for {}: ack buffer full", tick_id);
            return;
        }
        self.pending_acks.push(tick_id);
    }

    /// The peer acknowledged datagram `block_id`: release every entry that was
    ///  embedded in it, in every queue.
    pub fn ack(&mut self, block_id: u16) {
        trace!("peer acknowledged block {}", block_id);
        self.unreliable.ack(block_id);
        self.immediate.ack(block_id);
        self.ordered.ack(block_id);
    }

    /// Forget everything scheduled and restart the sequence space, for a
    ///  (re)connecting peer.
    pub fn reset(&mut self) {
        self.tick_id = 0;
        self.pending_acks.clear();
        self.unreliable.clear();
        self.immediate.clear();
        self.ordered.clear();
        self.buffer.clear();
    }

    /// the datagram assembled by the last [`finish`](SuperPacket::finish)
    pub fn buffer(&self) -> &[u8] {
        self.buffer.as_ref()
    }

    /// Assemble this tick's datagram into the internal buffer and advance the
    ///  sequence id. Returns whether anything (acks or data) was written;
    ///  callers should skip the network send otherwise.
    pub fn finish(&mut self) -> bool {
        let tick_id = self.tick_id;

        self.buffer.clear();
        self.buffer.put_u16_le(0); // total length, patched below
        self.buffer.put_u16_le(tick_id);

        let had_acks = !self.pending_acks.is_empty();
        self.buffer.put_u8(self.pending_acks.len() as u8);
        for ack in self.pending_acks.drain(..) {
            self.buffer.put_u16_le(ack);
        }

        // one byte is reserved for the block count written below
        let mut remaining = USABLE_DATAGRAM_SIZE - self.buffer.len() - 1;
        let mut blocks = BlockMap::new();
        self.unreliable.process(tick_id, &mut remaining, &mut blocks);
        self.immediate.process(tick_id, &mut remaining, &mut blocks);
        self.ordered.process(tick_id, &mut remaining, &mut blocks);

        self.buffer.put_u8(blocks.len() as u8);
        let has_data = !blocks.is_empty();

        if has_data {
            self.write_blocks(blocks);
        }

        self.buffer.patch_u16_le(LENGTH_OFFSET, self.buffer.len() as u16);
        self.tick_id = seq::inc(self.tick_id);

        trace!("finished datagram for tick {}: {} bytes", tick_id, self.buffer.len());
        had_acks || has_data
    }

    /// Write the blocks in increasing logical recency. When the ids present
    ///  span a wrap of the sequence space, ids from the low half are shifted
    ///  past 2^16 so they sort after the pre-wrap ids.
    fn write_blocks(&mut self, blocks: BlockMap) {
        let mut emission: BTreeMap<u32, Vec<Packet>> = BTreeMap::new();
        if let (Some(&min), Some(&max)) = (blocks.keys().next(), blocks.keys().next_back()) {
            let wrapped = max - min >= u16::MAX / 2;
            for (block_id, packets) in blocks {
                let key = if wrapped && block_id < u16::MAX / 2 {
                    u32::from(block_id) + 0x1_0000
                } else {
                    u32::from(block_id)
                };
                emission.insert(key, packets);
            }
        }

        let mut counter: u8 = 0;
        for (key, packets) in emission {
            self.buffer.put_u16_le(key as u16);
            self.buffer.put_u8(packets.len() as u8);
            for packet in packets {
                if !packet.is_finished() {
                    // first transmission happens now: stamp the tick-local counter
                    packet.finish(counter);
                    counter = counter.wrapping_add(1);
                }
                packet.append_to(&mut self.buffer);
            }
        }
    }
}
