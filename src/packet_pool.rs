//! A bounded pool of packet buffers, shared by the connections of one worker
//!  (or of the whole process - it locks). Exhaustion is an explicit error:
//!  handing out more buffers than the configured bound would mean unbounded
//!  memory growth under a stalled peer, so the caller gets to decide.

use crate::buffers::ArrayBuf;
use crate::packet::{AckCallback, Packet, MAX_PACKET_SIZE};
use anyhow::bail;
use bytes::BufMut;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

pub struct PacketPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

struct PoolState {
    free: Vec<ArrayBuf<MAX_PACKET_SIZE>>,
    in_flight: usize,
}

impl PacketPool {
    pub fn new(capacity: usize) -> PacketPool {
        PacketPool {
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                in_flight: 0,
            }),
        }
    }

    /// Allocate a packet with its opcode field initialized and the rest of
    ///  the header zeroed.
    pub fn allocate(self: &Arc<Self>, opcode: u16) -> anyhow::Result<Packet> {
        self.allocate_inner(opcode, None)
    }

    /// Like [`allocate`](PacketPool::allocate), additionally registering a
    ///  callback invoked exactly once when the packet has been sent,
    ///  acknowledged by the peer and released by every queue holding it.
    pub fn allocate_with(
        self: &Arc<Self>,
        opcode: u16,
        on_ack: impl FnOnce() + 'static,
    ) -> anyhow::Result<Packet> {
        self.allocate_inner(opcode, Some(Box::new(on_ack)))
    }

    fn allocate_inner(self: &Arc<Self>, opcode: u16, on_ack: Option<AckCallback>) -> anyhow::Result<Packet> {
        let mut buf = self.acquire()?;
        buf.put_u8(0); // length, stamped at finish time
        buf.put_u8(0); // tick-local counter, stamped at finish time
        buf.put_u16_le(opcode);
        buf.put_u8(0); // application id
        Ok(Packet::from_parts(buf, on_ack, Arc::clone(self)))
    }

    fn acquire(&self) -> anyhow::Result<ArrayBuf<MAX_PACKET_SIZE>> {
        let mut state = self.state.lock().unwrap();
        if let Some(buf) = state.free.pop() {
            trace!("returning packet buffer from pool");
            state.in_flight += 1;
            return Ok(buf);
        }
        if state.in_flight < self.capacity {
            debug!("no packet buffer in pool: creating new buffer");
            state.in_flight += 1;
            return Ok(ArrayBuf::new());
        }
        bail!("packet pool exhausted: {} packets in flight", self.capacity);
    }

    pub(crate) fn recycle(&self, mut buf: ArrayBuf<MAX_PACKET_SIZE>) {
        buf.clear();
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        state.free.push(buf);
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }
}
