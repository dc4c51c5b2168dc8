//! Reliability classes layered over a packing strategy.

use crate::packers::{BlockMap, Packer};

/// Retries entries indefinitely until the peer acknowledges them.
pub struct ReliableQueue<P: Packer> {
    packer: P,
}

impl<P: Packer> ReliableQueue<P> {
    pub fn new(packer: P) -> ReliableQueue<P> {
        ReliableQueue { packer }
    }

    pub fn add(&mut self, message: P::Message) {
        self.packer.add(message);
    }

    pub fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap) {
        self.packer.process(tick_id, remaining, blocks);
    }

    pub fn ack(&mut self, block_id: u16) {
        self.packer.ack(block_id);
    }

    pub fn clear(&mut self) {
        self.packer.clear();
    }
}

/// Grants entries a bounded number of transmissions. With `max_retries == 0`
///  the queue is fire-and-forget: everything pending is discarded right after
///  each tick's processing, whether or not it was embedded.
pub struct UnreliableQueue<P: Packer> {
    packer: P,
    max_retries: usize,
}

impl<P: Packer> UnreliableQueue<P> {
    pub fn new(packer: P, max_retries: usize) -> UnreliableQueue<P> {
        UnreliableQueue { packer, max_retries }
    }

    pub fn add(&mut self, message: P::Message) {
        self.packer.add(message);
    }

    pub fn process(&mut self, tick_id: u16, remaining: &mut usize, blocks: &mut BlockMap) {
        self.packer.process(tick_id, remaining, blocks);
        if self.max_retries == 0 {
            self.packer.clear();
        } else {
            self.packer.drop_exhausted(self.max_retries);
        }
    }

    /// acknowledgements still release surviving entries early
    pub fn ack(&mut self, block_id: u16) {
        self.packer.ack(block_id);
    }

    pub fn clear(&mut self) {
        self.packer.clear();
    }
}
