//! Latest-value packing: entries are keyed, and a new packet for a key
//!  replaces whatever was pending under it - only the most recent value per
//!  key is ever in flight. Entries are packed individually and retransmitted
//!  independently under the shared pending rule, each labeled with the
//!  sequence id of its first transmission.
//!
//! Two keyings are provided: by the packet header's application id byte
//!  (per-entity state) and by opcode (per-message-category state).

use super::{block_cost, carrier_block, is_due, sent_this_tick, BlockMap, Packer};
use crate::config::ProtocolConfig;
use crate::packet::Packet;
use rustc_hash::FxHashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

/// how a packet maps to its supersede key
pub trait PacketKey {
    type Key: Eq + Hash + Copy + Debug;

    fn key(packet: &Packet) -> Self::Key;
}

/// keyed by the header's application id byte
pub struct ById;

impl PacketKey for ById {
    type Key = u8;

    fn key(packet: &Packet) -> u8 {
        packet.id()
    }
}

/// keyed by the header's opcode
pub struct ByOpcode;

impl PacketKey for ByOpcode {
    type Key = u16;

    fn key(packet: &Packet) -> u16 {
        packet.opcode()
    }
}

pub type MostRecentPackerById = MostRecentPacker<ById>;
pub type MostRecentPackerByOpcode = MostRecentPacker<ByOpcode>;

pub struct MostRecentPacker<E: PacketKey> {
    config: Arc<ProtocolConfig>,
    pending: Vec<PendingPacket<E::Key>>,
    index: FxHashMap<E::Key, usize>,
    _keying: PhantomData<E>,
}

struct PendingPacket<K> {
    key: K,
    packet: Packet,
    transmissions: Vec<u16>,
}

impl<E: PacketKey> MostRecentPacker<E> {
    pub fn new(config: Arc<ProtocolConfig>) -> MostRecentPacker<E> {
        MostRecentPacker {
            config,
            pending: Vec::new(),
            index: FxHashMap::default(),
            _keying: PhantomData,
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (position, entry) in self.pending.iter().enumerate() {
            self.index.insert(entry.key, position);
        }
    }
}

impl<E: PacketKey> Packer for MostRecentPacker<E> {
    type Message = Packet;

    fn add(&mut self, packet: Packet) {
        let key = E::key(&packet);
        match self.index.get(&key) {
            Some(&position) => {
                trace!("superseding pending packet for key {:?}", key);
                let entry = &mut self.pending[position];
                entry.packet = packet;
                entry.transmissions.clear();
            }
            None => {
                self.index.insert(key, self.pending.len());
                self.pending.push(PendingPacket {
                    key,
                    packet,
                    transmissions: Vec::new(),
                });
            }
        }
    }

    fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap) {
        for entry in &mut self.pending {
            if sent_this_tick(&entry.transmissions, tick_id) {
                continue;
            }
            if !is_due(&entry.transmissions, tick_id, self.config.resend_threshold) {
                continue;
            }
            let block = carrier_block(&entry.transmissions, tick_id);
            let cost = entry.packet.size() + block_cost(blocks, block);
            if cost > *remaining {
                // entries are independent of each other; try the next one
                continue;
            }
            *remaining -= cost;
            blocks.entry(block).or_default().push(entry.packet.clone());
            entry.transmissions.push(tick_id);
        }
    }

    fn ack(&mut self, block_id: u16) {
        let before = self.pending.len();
        self.pending.retain(|entry| {
            if entry.transmissions.contains(&block_id) {
                entry.packet.mark_acked();
                false
            } else {
                true
            }
        });
        if self.pending.len() != before {
            self.rebuild_index();
        }
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.index.clear();
    }

    fn drop_exhausted(&mut self, max_retries: usize) {
        let before = self.pending.len();
        self.pending.retain(|entry| entry.transmissions.len() <= max_retries);
        if self.pending.len() != before {
            self.rebuild_index();
        }
    }
}
