use crate::packet_reader::PacketReader;

/// The seam between the protocol and the application's message catalogue:
///  one implementation per connection, fed every deduplicated application
///  packet in arrival order.
pub trait PacketHandler {
    /// Decode and dispatch one packet. Returning `false` signals that the
    ///  packet could not be decoded (unknown opcode, malformed payload); the
    ///  protocol then aborts the remainder of the datagram and reports an
    ///  error so the caller can decide whether to penalize the peer.
    fn handle(&mut self, reader: &mut PacketReader<'_>) -> bool;
}
