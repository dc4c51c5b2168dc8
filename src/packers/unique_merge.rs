//! Keyed merged packing: like [`MergePacker`](super::MergePacker), but each
//!  record carries an application key, and enqueueing a second record for the
//!  same key supersedes the first - only the latest payload per key is ever
//!  in flight. When one merged packet cannot hold all pending records, the
//!  strategy emits several in the same tick, filling each up to the 255-byte
//!  packet cap and stopping only when the datagram budget runs out.

use super::{block_cost, sent_this_tick, BlockMap, Packer};
use crate::packet::{DATA_START, MAX_PACKET_SIZE};
use crate::packet_pool::PacketPool;
use rustc_hash::FxHashMap;
use std::hash::Hash;
use std::sync::Arc;
use tracing::warn;

const ENVELOPE: usize = DATA_START + 1;

pub struct UniqueMergePacker<K: Eq + Hash + Copy> {
    pool: Arc<PacketPool>,
    opcode: u16,
    pending: Vec<PendingData<K>>,
    index: FxHashMap<K, usize>,
}

struct PendingData<K> {
    key: K,
    data: Vec<u8>,
    transmissions: Vec<u16>,
}

impl<K: Eq + Hash + Copy> UniqueMergePacker<K> {
    pub fn new(pool: Arc<PacketPool>) -> UniqueMergePacker<K> {
        UniqueMergePacker {
            pool,
            opcode: 0,
            pending: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn rebuild_index(&mut self) {
        self.index.clear();
        for (position, record) in self.pending.iter().enumerate() {
            self.index.insert(record.key, position);
        }
    }
}

impl<K: Eq + Hash + Copy> Packer for UniqueMergePacker<K> {
    /// application key, opcode of the shared packet, record payload
    type Message = (K, u16, Vec<u8>);

    fn add(&mut self, (key, opcode, data): (K, u16, Vec<u8>)) {
        if ENVELOPE + data.len() > MAX_PACKET_SIZE {
            warn!("discarding {} byte record: it can never fit a merged packet", data.len());
            return;
        }
        self.opcode = opcode;
        match self.index.get(&key) {
            Some(&position) => {
                // supersede: newest payload wins, transmission history resets
                let record = &mut self.pending[position];
                record.data = data;
                record.transmissions.clear();
            }
            None => {
                self.index.insert(key, self.pending.len());
                self.pending.push(PendingData {
                    key,
                    data,
                    transmissions: Vec::new(),
                });
            }
        }
    }

    fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap) {
        let eligible: Vec<usize> = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, record)| !sent_this_tick(&record.transmissions, tick_id))
            .map(|(index, _)| index)
            .collect();
        let mut eligible = eligible.into_iter().peekable();

        while eligible.peek().is_some() {
            let overhead = block_cost(blocks, tick_id);

            let mut size = ENVELOPE;
            let mut selected = Vec::new();
            while let Some(&index) = eligible.peek() {
                let record_len = self.pending[index].data.len();
                if size + record_len > MAX_PACKET_SIZE
                    || size + record_len + overhead > *remaining
                    || selected.len() == u8::MAX as usize
                {
                    break;
                }
                size += record_len;
                selected.push(index);
                eligible.next();
            }
            if selected.is_empty() {
                // datagram budget exhausted; leftovers stay pending
                return;
            }

            let mut packet = match self.pool.allocate(self.opcode) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("cannot assemble merged packet, deferring {} records: {}", selected.len(), e);
                    return;
                }
            };
            packet.write_u8(selected.len() as u8);
            for index in selected {
                let record = &mut self.pending[index];
                packet.write_raw(&record.data);
                record.transmissions.push(tick_id);
            }

            *remaining -= size + overhead;
            blocks.entry(tick_id).or_default().push(packet);
        }
    }

    fn ack(&mut self, block_id: u16) {
        let before = self.pending.len();
        self.pending.retain(|record| !record.transmissions.contains(&block_id));
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
        self.pending.retain(|record| record.transmissions.len() <= max_retries);
        if self.pending.len() != before {
            self.rebuild_index();
        }
    }
}
