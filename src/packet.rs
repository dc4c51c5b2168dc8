//! The 255-byte application packet and its encode API.
//!
//! A [`Packet`] is a shared handle: the queue that owns a pending message and
//!  the per-tick block map being serialized both hold the same underlying
//!  buffer, and retransmissions re-embed the identical bytes. The buffer goes
//!  back to its [pool](crate::packet_pool::PacketPool) when the last handle
//!  drops; at that moment, and only if the owning queue has marked the packet
//!  acknowledged, a registered callback fires exactly once.

use crate::buffers::ArrayBuf;
use crate::packet_pool::PacketPool;
use bytes::BufMut;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt::{Debug, Formatter};
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

/// hard upper bound for one packet, header included
pub const MAX_PACKET_SIZE: usize = 255;

/// offset of the first payload byte
pub const DATA_START: usize = 5;

const LENGTH_OFFSET: usize = 0;
const COUNTER_OFFSET: usize = 1;
const OPCODE_OFFSET: usize = 2;
const ID_OFFSET: usize = 4;

pub type AckCallback = Box<dyn FnOnce()>;

pub struct Packet {
    inner: Rc<RefCell<PacketInner>>,
}

struct PacketInner {
    buf: ArrayBuf<MAX_PACKET_SIZE>,
    on_ack: Option<AckCallback>,
    acked: bool,
    finished: bool,
    pool: Arc<PacketPool>,
}

impl Drop for PacketInner {
    fn drop(&mut self) {
        if self.acked {
            if let Some(callback) = self.on_ack.take() {
                callback();
            }
        }
        self.pool.recycle(mem::take(&mut self.buf));
    }
}

impl Packet {
    pub(crate) fn from_parts(
        buf: ArrayBuf<MAX_PACKET_SIZE>,
        on_ack: Option<AckCallback>,
        pool: Arc<PacketPool>,
    ) -> Packet {
        Packet {
            inner: Rc::new(RefCell::new(PacketInner {
                buf,
                on_ack,
                acked: false,
                finished: false,
                pool,
            })),
        }
    }

    pub fn opcode(&self) -> u16 {
        let inner = self.inner.borrow();
        let bytes = inner.buf.as_ref();
        u16::from_le_bytes([bytes[OPCODE_OFFSET], bytes[OPCODE_OFFSET + 1]])
    }

    pub fn id(&self) -> u8 {
        self.inner.borrow().buf.as_ref()[ID_OFFSET]
    }

    /// assign the application id used by keyed packing strategies
    pub fn set_id(&mut self, id: u8) {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.finished, "modifying a finished packet");
        inner.buf.patch_u8(ID_OFFSET, id);
    }

    /// the tick-local counter, meaningful only after [`finish`](Packet::finish)
    pub fn counter(&self) -> u8 {
        self.inner.borrow().buf.as_ref()[COUNTER_OFFSET]
    }

    /// current size in bytes, header included
    pub fn size(&self) -> usize {
        self.inner.borrow().buf.len()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.borrow().finished
    }

    /// Stamp the length byte and the tick-local counter. Must be called
    ///  exactly once, immediately before the bytes are copied into a datagram
    ///  for the first time; retransmissions reuse the stamped bytes.
    pub fn finish(&self, counter: u8) {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.finished, "finishing a packet twice");
        let len = inner.buf.len();
        inner.buf.patch_u8(LENGTH_OFFSET, len as u8);
        inner.buf.patch_u8(COUNTER_OFFSET, counter);
        inner.finished = true;
    }

    /// Flag the packet as delivered; the on-ack callback (if any) fires when
    ///  the last handle drops.
    pub fn mark_acked(&self) {
        self.inner.borrow_mut().acked = true;
    }

    pub fn bytes(&self) -> Ref<'_, [u8]> {
        Ref::map(self.inner.borrow(), |inner| inner.buf.as_ref())
    }

    pub fn append_to(&self, out: &mut impl BufMut) {
        out.put_slice(&self.bytes());
    }

    fn reserve(&self, additional: usize) -> RefMut<'_, PacketInner> {
        let inner = self.inner.borrow_mut();
        assert!(!inner.finished, "writing to a finished packet");
        assert!(
            inner.buf.len() + additional <= MAX_PACKET_SIZE,
            "write of {} bytes would exceed the packet capacity of {} bytes",
            additional,
            MAX_PACKET_SIZE
        );
        inner
    }

    pub fn write_u8(&mut self, value: u8) {
        self.reserve(1).buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.reserve(2).buf.put_u16_le(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.reserve(4).buf.put_u32_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.reserve(8).buf.put_u64_le(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.reserve(1).buf.put_i8(value);
    }

    pub fn write_i16(&mut self, value: i16) {
        self.reserve(2).buf.put_i16_le(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.reserve(4).buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.reserve(8).buf.put_i64_le(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    /// raw IEEE-754 bit copy, not a textual representation
    pub fn write_f32(&mut self, value: f32) {
        self.write_u32(value.to_bits());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.write_u64(value.to_bits());
    }

    /// u8 length prefix followed by the raw UTF-8 bytes
    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// u8 length prefix followed by the raw bytes
    pub fn write_bytes(&mut self, value: &[u8]) {
        assert!(value.len() <= u8::MAX as usize, "length-prefixed write of {} bytes", value.len());
        let mut inner = self.reserve(1 + value.len());
        inner.buf.put_u8(value.len() as u8);
        inner.buf.put_slice(value);
    }

    /// append bytes without a length prefix; the payload must be
    ///  self-delimiting for the receiving side
    pub fn write_raw(&mut self, value: &[u8]) {
        self.reserve(value.len()).buf.put_slice(value);
    }

    /// Copy another packet's payload (its header excluded) at the cursor.
    ///  This is how merge strategies embed one packet inside another's data
    ///  section.
    pub fn write_packet(&mut self, other: &Packet) {
        let other_inner = other.inner.borrow();
        let payload = &other_inner.buf.as_ref()[DATA_START..];
        self.reserve(payload.len()).buf.put_slice(payload);
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        Packet { inner: Rc::clone(&self.inner) }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Packet")
            .field("opcode", &format_args!("{:#06x}", self.opcode()))
            .field("size", &inner.buf.len())
            .field("finished", &inner.finished)
            .finish()
    }
}
