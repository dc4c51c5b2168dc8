//! Merged packing: every pending record is copied into one shared wire packet
//!  per tick, prefixed with a record count. Records are opaque, self-delimiting
//!  application payloads; there is no per-record receive-side deduplication,
//!  so the merged data must be idempotent (typical use: movement deltas and
//!  other state that is simply overwritten on arrival).

use super::{block_cost, sent_this_tick, BlockMap, Packer};
use crate::packet::{DATA_START, MAX_PACKET_SIZE};
use crate::packet_pool::PacketPool;
use std::sync::Arc;
use tracing::warn;

/// bytes of a merged packet that are not records: header + record count
const ENVELOPE: usize = DATA_START + 1;

pub struct MergePacker {
    pool: Arc<PacketPool>,
    opcode: u16,
    pending: Vec<PendingData>,
}

struct PendingData {
    data: Vec<u8>,
    transmissions: Vec<u16>,
}

impl MergePacker {
    pub fn new(pool: Arc<PacketPool>) -> MergePacker {
        MergePacker {
            pool,
            opcode: 0,
            pending: Vec::new(),
        }
    }
}

impl Packer for MergePacker {
    /// opcode of the shared packet plus one record; all records enqueued into
    ///  one merge packer share the opcode
    type Message = (u16, Vec<u8>);

    fn add(&mut self, (opcode, data): (u16, Vec<u8>)) {
        if ENVELOPE + data.len() > MAX_PACKET_SIZE {
            warn!("discarding {} byte record: it can never fit a merged packet", data.len());
            return;
        }
        self.opcode = opcode;
        self.pending.push(PendingData {
            data,
            transmissions: Vec::new(),
        });
    }

    fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap) {
        let overhead = block_cost(blocks, tick_id);

        let mut size = ENVELOPE;
        let mut selected = Vec::new();
        for (index, record) in self.pending.iter().enumerate() {
            if sent_this_tick(&record.transmissions, tick_id) {
                continue;
            }
            if size + record.data.len() > MAX_PACKET_SIZE
                || size + record.data.len() + overhead > *remaining
                || selected.len() == u8::MAX as usize
            {
                break;
            }
            size += record.data.len();
            selected.push(index);
        }
        if selected.is_empty() {
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

    fn ack(&mut self, block_id: u16) {
        self.pending.retain(|record| !record.transmissions.contains(&block_id));
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    fn drop_exhausted(&mut self, max_retries: usize) {
        self.pending.retain(|record| record.transmissions.len() <= max_retries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packers::BLOCK_OVERHEAD;

    fn setup() -> MergePacker {
        MergePacker::new(Arc::new(PacketPool::new(16)))
    }

    #[test]
    fn test_records_share_one_packet() {
        let mut packer = setup();
        packer.add((0x30, vec![1, 2, 3]));
        packer.add((0x30, vec![4, 5]));

        let mut remaining = 500;
        let mut blocks = BlockMap::new();
        packer.process(4, &mut remaining, &mut blocks);

        assert_eq!(blocks[&4].len(), 1);
        let packet = &blocks[&4][0];
        packet.finish(0);
        assert_eq!(&*packet.bytes(), &[11, 0, 0x30, 0, 0, 2, 1, 2, 3, 4, 5]);
        assert_eq!(remaining, 500 - 11 - BLOCK_OVERHEAD);
    }

    #[test]
    fn test_unacknowledged_records_remerge_every_tick() {
        let mut packer = setup();
        packer.add((0x30, vec![1]));

        for tick in 0..3u16 {
            let mut remaining = 500;
            let mut blocks = BlockMap::new();
            packer.process(tick, &mut remaining, &mut blocks);
            assert_eq!(blocks[&tick].len(), 1, "tick {}", tick);
        }
    }

    #[test]
    fn test_ack_releases_embedded_records() {
        let mut packer = setup();
        packer.add((0x30, vec![1]));

        let mut remaining = 500;
        let mut blocks = BlockMap::new();
        packer.process(9, &mut remaining, &mut blocks);
        packer.ack(9);

        let mut remaining = 500;
        let mut blocks = BlockMap::new();
        packer.process(10, &mut remaining, &mut blocks);
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_budget_stops_at_first_overflowing_record() {
        let mut packer = setup();
        packer.add((0x30, vec![0; 10]));
        packer.add((0x30, vec![0; 100]));
        packer.add((0x30, vec![0; 1]));

        let mut remaining = ENVELOPE + BLOCK_OVERHEAD + 20;
        let mut blocks = BlockMap::new();
        packer.process(0, &mut remaining, &mut blocks);

        // only the first record went out; the walk stopped at the second
        let packet = &blocks[&0][0];
        assert_eq!(packet.size(), ENVELOPE + 10);
    }

    #[test]
    fn test_pool_exhaustion_defers_records() {
        let pool = Arc::new(PacketPool::new(1));
        let mut packer = MergePacker::new(Arc::clone(&pool));
        packer.add((0x30, vec![1, 2]));

        let hog = pool.allocate(0x01).unwrap();
        let mut remaining = 500;
        let mut blocks = BlockMap::new();
        packer.process(0, &mut remaining, &mut blocks);
        assert!(blocks.is_empty());
        assert_eq!(remaining, 500, "a deferred tick must not consume budget");

        // with a buffer available again the record goes out
        drop(hog);
        let mut remaining = 500;
        let mut blocks = BlockMap::new();
        packer.process(1, &mut remaining, &mut blocks);
        assert_eq!(blocks[&1].len(), 1);
    }

    #[test]
    fn test_oversized_record_rejected_at_enqueue() {
        let mut packer = setup();
        packer.add((0x30, vec![0; MAX_PACKET_SIZE]));

        let mut remaining = 500;
        let mut blocks = BlockMap::new();
        packer.process(0, &mut remaining, &mut blocks);
        assert!(blocks.is_empty());
    }
}
