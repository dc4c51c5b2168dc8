//! Strict-order packing: every message is an independent packet, and the
//!  whole backlog is re-walked oldest to newest whenever the strategy decides
//!  a send is worthwhile. Because the walk stops at the first entry that does
//!  not fit, the peer never observes a later message without all earlier ones
//!  being at least in flight.

use super::{block_cost, carrier_block, sent_this_tick, BlockMap, Packer};
use crate::config::ProtocolConfig;
use crate::packet::Packet;
use crate::seq;
use std::sync::Arc;
use tracing::trace;

pub struct OrderedPacker {
    config: Arc<ProtocolConfig>,
    pending: Vec<PendingPacket>,
    last_sent: Option<u16>,
}

struct PendingPacket {
    packet: Packet,
    /// sequence ids this entry has been embedded under, oldest first
    transmissions: Vec<u16>,
}

impl OrderedPacker {
    pub fn new(config: Arc<ProtocolConfig>) -> OrderedPacker {
        OrderedPacker {
            config,
            pending: Vec::new(),
            last_sent: None,
        }
    }
}

impl Packer for OrderedPacker {
    type Message = Packet;

    fn add(&mut self, packet: Packet) {
        self.pending.push(PendingPacket {
            packet,
            transmissions: Vec::new(),
        });
    }

    fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap) {
        if self.pending.is_empty() {
            return;
        }

        // a send is due when something new arrived, or the backlog went
        //  unacknowledged for longer than the resend threshold
        let has_new = self.pending.iter().any(|entry| entry.transmissions.is_empty());
        let due = has_new
            || match self.last_sent {
                None => true,
                Some(last) => seq::sub(tick_id, last) > self.config.resend_threshold,
            };
        if !due {
            return;
        }

        let mut sent_any = false;
        for entry in &mut self.pending {
            if sent_this_tick(&entry.transmissions, tick_id) {
                continue;
            }
            let block = carrier_block(&entry.transmissions, tick_id);
            let cost = entry.packet.size() + block_cost(blocks, block);
            if cost > *remaining {
                // in-order delivery: nothing after this entry may go either
                break;
            }
            *remaining -= cost;
            blocks.entry(block).or_default().push(entry.packet.clone());
            entry.transmissions.push(tick_id);
            sent_any = true;
        }

        if sent_any {
            self.last_sent = Some(tick_id);
        }
    }

    fn ack(&mut self, block_id: u16) {
        self.pending.retain(|entry| {
            if entry.transmissions.contains(&block_id) {
                trace!("ordered entry acknowledged via block {}", block_id);
                entry.packet.mark_acked();
                false
            } else {
                true
            }
        });
    }

    fn clear(&mut self) {
        self.pending.clear();
        self.last_sent = None;
    }

    fn drop_exhausted(&mut self, max_retries: usize) {
        self.pending.retain(|entry| entry.transmissions.len() <= max_retries);
    }
}
