//! The receive-side state machine of one connection.
//!
//! For every accepted datagram the protocol replays the embedded
//!  acknowledgements into the connection's outgoing queues, schedules an
//!  acknowledgement of its own, suppresses packets it has already dispatched
//!  (a retransmitted packet arrives under its original block id with its
//!  original counter, however many datagrams carried it) and hands the rest
//!  to the application's [`PacketHandler`]. Stale datagrams - anything not
//!  at-or-after the expected sequence id - are absorbed silently: whatever
//!  they carry has been superseded or will be retransmitted.
//!
//! Liveness is tick-counted. [`tick`](Protocol::tick) must be called once per
//!  connection tick after draining received datagrams; it reports a timeout
//!  once no datagram has been accepted for longer than the configured
//!  disconnect window. What to do about a dead peer is the caller's decision.

use crate::config::ProtocolConfig;
use crate::handler::PacketHandler;
use crate::packet_reader::PacketReader;
use crate::seq;
use crate::super_packet::SuperPacket;
use crate::super_packet_reader::SuperPacketReader;
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Receive-side ordering discipline. Only [`NoBuffer`](BufferMode::NoBuffer)
///  is implemented: out-of-order datagrams are dropped as stale rather than
///  buffered for reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMode {
    NoBuffer,
    Buffering,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// the datagram was accepted and its contents processed
    Dispatched,
    /// the datagram was older than the expected sequence id and ignored
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// nothing received for longer than the disconnect threshold
    TimedOut,
}

pub struct Protocol {
    config: Arc<ProtocolConfig>,
    buffer_mode: BufferMode,
    since_last_send: u16,
    since_last_recv: u16,
    last_tick_id: u16,
    expected_tick_id: u16,
    /// receive instant anchored at the most recently accepted sequence id;
    ///  receive times of older ids are extrapolated backwards from here
    timestamp: Option<(u16, Instant)>,
    /// per block id, the tick-local packet counters already dispatched
    resolved: FxHashMap<u16, FxHashSet<u8>>,
}

impl Protocol {
    pub fn new(config: Arc<ProtocolConfig>) -> Protocol {
        Protocol {
            config,
            buffer_mode: BufferMode::NoBuffer,
            since_last_send: 0,
            since_last_recv: 0,
            last_tick_id: 0,
            expected_tick_id: 0,
            timestamp: None,
            resolved: FxHashMap::default(),
        }
    }

    /// Like [`new`](Protocol::new) with an explicit buffering mode. The
    ///  buffered reordering modes are not implemented and are rejected here
    ///  rather than silently corrupting the sequence state later.
    pub fn with_buffer_mode(config: Arc<ProtocolConfig>, mode: BufferMode) -> anyhow::Result<Protocol> {
        if mode != BufferMode::NoBuffer {
            bail!("buffer mode {:?} is not supported", mode);
        }
        Ok(Protocol::new(config))
    }

    pub fn buffer_mode(&self) -> BufferMode {
        self.buffer_mode
    }

    /// Forget all per-peer state, for a (re)connecting peer.
    pub fn reset(&mut self) {
        self.since_last_send = 0;
        self.since_last_recv = 0;
        self.last_tick_id = 0;
        self.expected_tick_id = 0;
        self.timestamp = None;
        self.resolved.clear();
    }

    /// Is `tick_id` at-or-after the next expected sequence id?
    pub fn is_expected(&self, tick_id: u16) -> bool {
        seq::ge(tick_id, self.expected_tick_id)
    }

    /// the sequence id of the most recently accepted datagram
    pub fn last_tick_id(&self) -> u16 {
        self.last_tick_id
    }

    /// Process one received datagram. Returns [`ReadStatus::Stale`] for
    ///  outdated datagrams, an error for malformed ones (the remainder of the
    ///  datagram is not dispatched; penalizing the peer is up to the caller).
    pub fn read(
        &mut self,
        datagram: &[u8],
        super_packet: &mut SuperPacket,
        handler: &mut dyn PacketHandler,
        now: Instant,
    ) -> anyhow::Result<ReadStatus> {
        let reader = SuperPacketReader::parse(datagram)?;
        let tick_id = reader.tick_id();

        if !self.is_expected(tick_id) {
            trace!("dropping stale datagram {}: expecting {}", tick_id, self.expected_tick_id);
            self.since_last_recv = self.since_last_recv.saturating_add(1);
            return Ok(ReadStatus::Stale);
        }

        for &ack in reader.acks() {
            super_packet.ack(ack);
        }
        if reader.has_data() {
            // data must be acknowledged so the peer can release it
            super_packet.schedule_ack(tick_id);
        }

        self.timestamp = Some((tick_id, now));

        reader.for_each_packet(|block_id, bytes| {
            let mut packet_reader = PacketReader::new(bytes, self.stamp(block_id, now))?;
            if !self.resolve(block_id, packet_reader.counter()) {
                trace!("suppressing duplicate packet {} of block {}", packet_reader.counter(), block_id);
                return Ok(());
            }
            if !handler.handle(&mut packet_reader) {
                bail!(
                    "handler rejected packet with opcode {:#06x} in block {}",
                    packet_reader.opcode(),
                    block_id
                );
            }
            Ok(())
        })?;

        // the suppression window trails the newest accepted id
        let resync_threshold = self.config.resync_threshold;
        self.resolved.retain(|&block_id, _| seq::sub(tick_id, block_id) <= resync_threshold);

        self.last_tick_id = tick_id;
        self.expected_tick_id = seq::inc(tick_id);
        self.since_last_recv = 0;
        Ok(ReadStatus::Dispatched)
    }

    /// Record that the packet `counter` of block `block_id` is being
    ///  dispatched; false means it already was and must be suppressed.
    pub fn resolve(&mut self, block_id: u16, counter: u8) -> bool {
        self.resolved.entry(block_id).or_default().insert(counter)
    }

    /// Advance the tick-counted clocks. Call once per connection tick, after
    ///  draining received datagrams.
    pub fn tick(&mut self) -> Liveness {
        self.since_last_send = self.since_last_send.saturating_add(1);
        self.since_last_recv = self.since_last_recv.saturating_add(1);
        if self.since_last_recv > self.config.disconnect_threshold {
            debug!("nothing received for {} ticks: reporting connection as dead", self.since_last_recv);
            Liveness::TimedOut
        } else {
            Liveness::Alive
        }
    }

    /// Whether this tick's datagram should actually be sent: always when it
    ///  carries something, and otherwise as a periodic keepalive so the
    ///  peer's liveness window stays open.
    pub fn should_send(&self, finish_wrote_payload: bool) -> bool {
        finish_wrote_payload || self.since_last_send >= self.config.ping_interval
    }

    /// Reset the keepalive clock after a datagram actually went out.
    pub fn on_sent(&mut self) {
        self.since_last_send = 0;
    }

    /// The extrapolated receive instant of `block_id`, anchored at the most
    ///  recently accepted datagram.
    pub fn block_timestamp(&self, block_id: u16) -> Option<Instant> {
        let (anchor_id, anchor) = self.timestamp?;
        Some(self.extrapolate(anchor_id, anchor, block_id))
    }

    fn stamp(&self, block_id: u16, now: Instant) -> Instant {
        match self.timestamp {
            Some((anchor_id, anchor)) => self.extrapolate(anchor_id, anchor, block_id),
            None => now,
        }
    }

    fn extrapolate(&self, anchor_id: u16, anchor: Instant, block_id: u16) -> Instant {
        let ticks_behind = u32::from(seq::sub(anchor_id, block_id));
        anchor
            .checked_sub(self.config.tick_interval * ticks_behind)
            .unwrap_or(anchor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_pool::PacketPool;
    use std::time::Duration;

    /// records every dispatched packet; rejects opcodes above the fence
    struct RecordingHandler {
        seen: Vec<(u16, u8, u32)>,
        reject_above: u16,
    }

    impl RecordingHandler {
        fn new() -> RecordingHandler {
            RecordingHandler {
                seen: Vec::new(),
                reject_above: u16::MAX,
            }
        }
    }

    impl PacketHandler for RecordingHandler {
        fn handle(&mut self, reader: &mut PacketReader<'_>) -> bool {
            if reader.opcode() > self.reject_above {
                return false;
            }
            let payload = reader.read_u32().unwrap_or(0);
            self.seen.push((reader.opcode(), reader.counter(), payload));
            true
        }
    }

    fn config() -> Arc<ProtocolConfig> {
        Arc::new(ProtocolConfig {
            resend_threshold: 5,
            resync_threshold: 32,
            disconnect_threshold: 10,
            ping_interval: 4,
            tick_interval: Duration::from_millis(50),
            ..ProtocolConfig::default()
        })
    }

    struct Peer {
        super_packet: SuperPacket,
        protocol: Protocol,
    }

    fn peer(pool: &Arc<PacketPool>) -> Peer {
        let config = config();
        Peer {
            super_packet: SuperPacket::new(&config, pool),
            protocol: Protocol::new(config),
        }
    }

    fn ordered_message(pool: &Arc<PacketPool>, opcode: u16, payload: u32) -> crate::packet::Packet {
        let mut packet = pool.allocate(opcode).unwrap();
        packet.write_u32(payload);
        packet
    }

    #[test]
    fn test_reliable_roundtrip_with_resend_and_ack() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now();

        // tick 0: the server sends message A; the datagram is lost
        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 42));
        assert!(server.super_packet.finish());

        // ticks 1..=5: nothing is due
        for tick in 1..=5u16 {
            assert!(!server.super_packet.finish(), "tick {}", tick);
        }

        // tick 6: A reappears, still labeled with sequence id 0
        assert!(server.super_packet.finish());
        let resend = server.super_packet.buffer().to_vec();
        let status = client
            .protocol
            .read(&resend, &mut client.super_packet, &mut handler, now)
            .unwrap();
        assert_eq!(status, ReadStatus::Dispatched);
        assert_eq!(handler.seen, vec![(0x10, 0, 42)]);

        // tick 7: the client's ack travels back and releases A
        assert!(client.super_packet.finish());
        let ack_datagram = client.super_packet.buffer().to_vec();
        server
            .protocol
            .read(&ack_datagram, &mut server.super_packet, &mut handler, now)
            .unwrap();

        for tick in 7..30u16 {
            assert!(!server.super_packet.finish(), "tick {}: A must be gone", tick);
        }
    }

    #[test]
    fn test_retransmission_is_dispatched_once() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now();

        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 7));
        server.super_packet.finish();
        let first = server.super_packet.buffer().to_vec();

        for _ in 1..=6 {
            server.super_packet.finish();
        }
        let resend = server.super_packet.buffer().to_vec();

        // both datagrams arrive: same block id, same counter, one dispatch
        client.protocol.read(&first, &mut client.super_packet, &mut handler, now).unwrap();
        let status = client
            .protocol
            .read(&resend, &mut client.super_packet, &mut handler, now)
            .unwrap();
        assert_eq!(status, ReadStatus::Dispatched);
        assert_eq!(handler.seen.len(), 1);
    }

    #[test]
    fn test_stale_datagram_is_ignored() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now();

        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.finish();
        let old = server.super_packet.buffer().to_vec();

        for _ in 1..=6 {
            server.super_packet.finish();
        }
        let newer = server.super_packet.buffer().to_vec();

        client.protocol.read(&newer, &mut client.super_packet, &mut handler, now).unwrap();
        let status = client
            .protocol
            .read(&old, &mut client.super_packet, &mut handler, now)
            .unwrap();
        assert_eq!(status, ReadStatus::Stale);
        assert_eq!(handler.seen.len(), 1, "the stale copy must not dispatch");
    }

    #[test]
    fn test_acks_replay_even_without_data() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now();

        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.finish();
        let data = server.super_packet.buffer().to_vec();
        client.protocol.read(&data, &mut client.super_packet, &mut handler, now).unwrap();

        // the client's next datagram carries only the ack
        client.super_packet.finish();
        let ack_only = client.super_packet.buffer().to_vec();
        server.protocol.read(&ack_only, &mut server.super_packet, &mut handler, now).unwrap();

        for _ in 1..30 {
            assert!(!server.super_packet.finish());
        }
    }

    #[test]
    fn test_handler_rejection_aborts_datagram() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        handler.reject_above = 0x10;
        let now = Instant::now();

        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.send_ordered(ordered_message(&pool, 0x99, 2));
        server.super_packet.send_ordered(ordered_message(&pool, 0x11, 3));
        server.super_packet.finish();
        let datagram = server.super_packet.buffer().to_vec();

        let result = client
            .protocol
            .read(&datagram, &mut client.super_packet, &mut handler, now);
        assert!(result.is_err());
        // dispatch stopped at the offending packet
        assert_eq!(handler.seen, vec![(0x10, 0, 1)]);
    }

    #[test]
    fn test_malformed_datagram_errors() {
        let pool = Arc::new(PacketPool::new(64));
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();

        let result = client.protocol.read(
            &[200, 0, 0, 0, 0, 0],
            &mut client.super_packet,
            &mut handler,
            Instant::now(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_liveness_times_out_and_recovers_on_data() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();

        for tick in 0..10 {
            assert_eq!(client.protocol.tick(), Liveness::Alive, "tick {}", tick);
        }
        assert_eq!(client.protocol.tick(), Liveness::TimedOut);

        // an accepted datagram resets the window
        server.super_packet.finish();
        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.finish();
        let datagram = server.super_packet.buffer().to_vec();
        client
            .protocol
            .read(&datagram, &mut client.super_packet, &mut handler, Instant::now())
            .unwrap();
        assert_eq!(client.protocol.tick(), Liveness::Alive);
    }

    #[test]
    fn test_keepalive_after_quiet_ticks() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);

        assert!(!server.protocol.should_send(false));
        for _ in 0..4 {
            server.protocol.tick();
        }
        assert!(server.protocol.should_send(false), "ping interval elapsed");
        server.protocol.on_sent();
        assert!(!server.protocol.should_send(false));
        assert!(server.protocol.should_send(true), "payload always sends");
    }

    #[test]
    fn test_suppression_window_is_pruned() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now();

        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.finish();
        let datagram = server.super_packet.buffer().to_vec();
        client.protocol.read(&datagram, &mut client.super_packet, &mut handler, now).unwrap();
        assert!(client.protocol.resolved.contains_key(&0));

        // push the window far past the resync threshold
        for _ in 1..=40 {
            server.super_packet.finish();
        }
        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 2));
        server.super_packet.finish();
        let datagram = server.super_packet.buffer().to_vec();
        client.protocol.read(&datagram, &mut client.super_packet, &mut handler, now).unwrap();

        assert!(!client.protocol.resolved.contains_key(&0), "entry for block 0 must be pruned");
        assert!(client.protocol.resolved.contains_key(&41));
    }

    #[test]
    fn test_block_timestamps_extrapolate_backwards() {
        let pool = Arc::new(PacketPool::new(64));
        let mut client = peer(&pool);
        let mut server = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now() + Duration::from_secs(10);

        // a datagram at tick 6 carrying a block first sent at tick 0
        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.finish();
        for _ in 1..=6 {
            server.super_packet.finish();
        }
        let datagram = server.super_packet.buffer().to_vec();
        client.protocol.read(&datagram, &mut client.super_packet, &mut handler, now).unwrap();

        let anchor = client.protocol.block_timestamp(6).unwrap();
        let origin = client.protocol.block_timestamp(0).unwrap();
        assert_eq!(anchor, now);
        assert_eq!(anchor - origin, 6 * Duration::from_millis(50));
    }

    #[test]
    fn test_unsupported_buffer_modes_rejected() {
        assert!(Protocol::with_buffer_mode(config(), BufferMode::Buffering).is_err());
        assert!(Protocol::with_buffer_mode(config(), BufferMode::Ready).is_err());
        let protocol = Protocol::with_buffer_mode(config(), BufferMode::NoBuffer).unwrap();
        assert_eq!(protocol.buffer_mode(), BufferMode::NoBuffer);
    }

    #[test]
    fn test_reset_clears_peer_state() {
        let pool = Arc::new(PacketPool::new(64));
        let mut server = peer(&pool);
        let mut client = peer(&pool);
        let mut handler = RecordingHandler::new();
        let now = Instant::now();

        server.super_packet.send_ordered(ordered_message(&pool, 0x10, 1));
        server.super_packet.finish();
        let datagram = server.super_packet.buffer().to_vec();
        client.protocol.read(&datagram, &mut client.super_packet, &mut handler, now).unwrap();
        assert!(!client.protocol.is_expected(0));

        client.protocol.reset();
        assert!(client.protocol.is_expected(0));
        assert!(client.protocol.block_timestamp(0).is_none());
    }
}
