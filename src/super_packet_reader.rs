//! Parsing and validation of one received datagram.
//!
//! Everything here comes straight off the network, so every length and count
//!  is treated as hostile until checked. A violation - a declared length that
//!  does not fit the datagram, a block without packets, a packet shorter than
//!  its own header - aborts the walk immediately; nothing after the violation
//!  point is dispatched. Whether to penalize the peer is the caller's call.

use crate::packet::DATA_START;
use anyhow::{bail, Context};
use bytes::Buf;

/// fixed header plus the two count bytes of an otherwise empty datagram
const MIN_DATAGRAM_SIZE: usize = 6;

pub struct SuperPacketReader<'a> {
    tick_id: u16,
    acks: Vec<u16>,
    block_count: u8,
    blocks: &'a [u8],
}

impl<'a> SuperPacketReader<'a> {
    pub fn parse(datagram: &'a [u8]) -> anyhow::Result<SuperPacketReader<'a>> {
        let mut cursor = datagram;
        let declared = cursor.try_get_u16_le().context("datagram length")? as usize;
        if declared < MIN_DATAGRAM_SIZE {
            bail!("declared datagram length {} is below the {} byte minimum", declared, MIN_DATAGRAM_SIZE);
        }
        if declared > datagram.len() {
            bail!("declared datagram length {} exceeds the received {} bytes", declared, datagram.len());
        }
        let mut cursor = &datagram[2..declared];

        let tick_id = cursor.try_get_u16_le().context("tick id")?;

        let ack_count = cursor.try_get_u8().context("ack count")?;
        let mut acks = Vec::with_capacity(ack_count as usize);
        for _ in 0..ack_count {
            acks.push(cursor.try_get_u16_le().context("acknowledged id")?);
        }

        let block_count = cursor.try_get_u8().context("block count")?;

        Ok(SuperPacketReader {
            tick_id,
            acks,
            block_count,
            blocks: cursor,
        })
    }

    /// the sequence id this datagram was sent under
    pub fn tick_id(&self) -> u16 {
        self.tick_id
    }

    /// sequence ids of our own datagrams the peer acknowledges herewith
    pub fn acks(&self) -> &[u16] {
        &self.acks
    }

    /// whether any application data blocks are present
    pub fn has_data(&self) -> bool {
        self.block_count > 0
    }

    /// Walk every block, yielding `(block id, packet bytes)` per embedded
    ///  packet in wire order. Aborts on the first malformed block or packet.
    pub fn for_each_packet(
        &self,
        mut f: impl FnMut(u16, &'a [u8]) -> anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        let mut cursor = self.blocks;
        for _ in 0..self.block_count {
            let block_id = cursor.try_get_u16_le().context("block id")?;
            let packet_count = cursor.try_get_u8().context("packet count")?;
            if packet_count == 0 {
                bail!("block {} declares zero packets", block_id);
            }
            for _ in 0..packet_count {
                if cursor.is_empty() {
                    bail!("block {} is truncated", block_id);
                }
                let len = cursor[0] as usize;
                if len < DATA_START {
                    bail!("packet of {} bytes in block {} is shorter than its header", len, block_id);
                }
                if len > cursor.len() {
                    bail!("packet of {} bytes in block {} runs past the end of the datagram", len, block_id);
                }
                f(block_id, &cursor[..len])?;
                cursor.advance(len);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    /// tick 4, acks [2, 3], one block (id 4) carrying one 6-byte packet
    fn valid_datagram() -> Vec<u8> {
        vec![
            19, 0, // length
            4, 0, // tick id
            2, 2, 0, 3, 0, // acks
            1, // one block
            4, 0, // block id
            1, // one packet
            6, 0, 0x42, 0, 0, 9, // packet: len 6, counter 0, opcode 0x42, id 0, payload 9
        ]
    }

    #[test]
    fn test_parse_valid() {
        let datagram = valid_datagram();
        let reader = SuperPacketReader::parse(&datagram).unwrap();
        assert_eq!(reader.tick_id(), 4);
        assert_eq!(reader.acks(), &[2, 3]);
        assert!(reader.has_data());

        let mut seen = Vec::new();
        reader
            .for_each_packet(|block_id, bytes| {
                seen.push((block_id, bytes.to_vec()));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(4, vec![6, 0, 0x42, 0, 0, 9])]);
    }

    #[test]
    fn test_empty_datagram() {
        let datagram = [6u8, 0, 9, 0, 0, 0];
        let reader = SuperPacketReader::parse(&datagram).unwrap();
        assert_eq!(reader.tick_id(), 9);
        assert!(reader.acks().is_empty());
        assert!(!reader.has_data());
    }

    fn corrupt(mutate: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut datagram = valid_datagram();
        mutate(&mut datagram);
        datagram
    }

    #[rstest]
    #[case::declared_length_past_end(corrupt(|d| d[0] = 200))]
    #[case::declared_length_below_minimum(corrupt(|d| d[0] = 3))]
    #[case::truncated_ack_region(corrupt(|d| { d[0] = 8; d.truncate(8); }))]
    fn test_malformed_header_rejected_at_parse(#[case] datagram: Vec<u8>) {
        assert!(SuperPacketReader::parse(&datagram).is_err());
    }

    #[rstest]
    #[case::zero_packet_block(corrupt(|d| d[12] = 0))]
    #[case::packet_shorter_than_header(corrupt(|d| d[13] = 3))]
    #[case::packet_past_datagram_end(corrupt(|d| d[13] = 200))]
    #[case::extra_block_beyond_data(corrupt(|d| d[9] = 2))]
    fn test_malformed_blocks_abort_walk(#[case] datagram: Vec<u8>) {
        let reader = SuperPacketReader::parse(&datagram).unwrap();
        assert!(reader.for_each_packet(|_, _| Ok(())).is_err());
    }

    #[test]
    fn test_dispatch_error_propagates() {
        let datagram = valid_datagram();
        let reader = SuperPacketReader::parse(&datagram).unwrap();
        assert!(reader.for_each_packet(|_, _| bail!("nope")).is_err());
    }
}
