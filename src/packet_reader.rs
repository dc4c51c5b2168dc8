//! Read-only cursor over one received application packet.
//!
//! Every read is bounds-checked against the packet's declared length and
//!  returns an error rather than running off the end - malformed packets come
//!  from the network, not from a bug on this side. The reader also carries the
//!  receive timestamp of the block the packet arrived in, interpolated by the
//!  protocol from the tick the block was first sent under.

use crate::packet::DATA_START;
use anyhow::bail;
use bytes::Buf;
use std::time::Instant;

pub struct PacketReader<'a> {
    packet: &'a [u8],
    payload: &'a [u8],
    timestamp: Instant,
}

impl<'a> PacketReader<'a> {
    pub fn new(packet: &'a [u8], timestamp: Instant) -> anyhow::Result<PacketReader<'a>> {
        if packet.len() < DATA_START {
            bail!("packet of {} bytes is shorter than its header", packet.len());
        }
        Ok(PacketReader {
            packet,
            payload: &packet[DATA_START..],
            timestamp,
        })
    }

    /// declared total length, header included
    pub fn length(&self) -> u8 {
        self.packet[0]
    }

    /// tick-local counter assigned by the sender
    pub fn counter(&self) -> u8 {
        self.packet[1]
    }

    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes([self.packet[2], self.packet[3]])
    }

    pub fn id(&self) -> u8 {
        self.packet[4]
    }

    /// interpolated wall-clock instant at which the carrying block was first
    ///  sent by the peer
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// payload bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.payload.len()
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.payload.try_get_u8()?)
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        Ok(self.payload.try_get_u16_le()?)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        Ok(self.payload.try_get_u32_le()?)
    }

    pub fn read_u64(&mut self) -> anyhow::Result<u64> {
        Ok(self.payload.try_get_u64_le()?)
    }

    pub fn read_i8(&mut self) -> anyhow::Result<i8> {
        Ok(self.payload.try_get_i8()?)
    }

    pub fn read_i16(&mut self) -> anyhow::Result<i16> {
        Ok(self.payload.try_get_i16_le()?)
    }

    pub fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(self.payload.try_get_i32_le()?)
    }

    pub fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(self.payload.try_get_i64_le()?)
    }

    pub fn read_bool(&mut self) -> anyhow::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_f32(&mut self) -> anyhow::Result<f32> {
        Ok(f32::from_bits(self.payload.try_get_u32_le()?))
    }

    pub fn read_f64(&mut self) -> anyhow::Result<f64> {
        Ok(f64::from_bits(self.payload.try_get_u64_le()?))
    }

    /// u8 length prefix followed by raw bytes
    pub fn read_bytes(&mut self) -> anyhow::Result<&'a [u8]> {
        let len = self.payload.try_get_u8()? as usize;
        if self.payload.len() < len {
            bail!("length-prefixed field of {} bytes exceeds the remaining {} payload bytes", len, self.payload.len());
        }
        let (bytes, rest) = self.payload.split_at(len);
        self.payload = rest;
        Ok(bytes)
    }

    pub fn read_str(&mut self) -> anyhow::Result<&'a str> {
        Ok(std::str::from_utf8(self.read_bytes()?)?)
    }
}
