//! Kaminari is the transport-and-reliability layer of a tick-driven multiplayer
//!  game server: it multiplexes many independent application messages onto
//!  periodic, size-bounded UDP datagrams, with a per-message reliability policy,
//!  retransmission, deduplication and acknowledgement - all inside a fixed
//!  512-byte budget per tick.
//!
//! ## Design goals
//!
//! * One datagram per connection per tick, never more. The simulation runs at a
//!   fixed rate, and the sequence number space models *ticks*, not datagrams
//!   actually put on the wire. This is what makes the receive-side resync and
//!   liveness windows meaningful: a peer that went quiet for N ticks is N ids
//!   behind, whether or not it had anything to say.
//! * Everything a tick produces must fit into 512 bytes. Pending messages that
//!   do not fit are deferred to a later tick, never dropped silently and never
//!   allowed to overflow the buffer.
//! * Reliability is a per-message-category decision, not a per-connection one.
//!   A category is backed by a [`packers::Packer`] strategy (ordered, merged,
//!   keyed-merged, latest-value-only) wrapped in a reliable or unreliable
//!   [queue](queues), and the categories compete for the per-tick byte budget
//!   in a fixed priority order.
//! * Retransmissions keep their original sequence id. A message first sent
//!   under id 7 is re-embedded under block id 7 in every later datagram that
//!   carries it, so the receiver can recognize it across resend windows with a
//!   single `(block id, packet counter)` lookup.
//! * No allocation of packet slots on the hot path: packets are fixed 255-byte
//!   buffers drawn from a bounded pool and shared by cheap handle cloning.
//!
//! Explicitly *not* goals: congestion control, encryption, NAT traversal, and
//!  the message schemas themselves. Sending and receiving the datagrams is the
//!  caller's business as well - this crate never touches a socket.
//!
//! ## Wire format
//!
//! All integers are little-endian.
//!
//! One application packet:
//! ```ascii
//! 0: total length including this header (u8)
//! 1: tick-local counter (u8) - assigned when the packet is first embedded,
//!     contiguous within that tick's datagram, stable across retransmissions
//! 2: opcode (u16)
//! 4: id (u8) - application-assigned, used by keyed packing strategies
//! 5: payload... (strings are a u8 length followed by raw bytes; floats are
//!     raw IEEE-754 bit copies)
//! ```
//!
//! One datagram ("super-packet"), at most 512 bytes:
//! ```ascii
//! 0: total datagram length (u16)
//! 2: sequence id of this tick (u16)
//! 4: ack count (u8)
//! *: acked sequence ids (ack count x u16)
//! *: block count (u8)
//! *: blocks, in ascending logical id order:
//!     block id (u16) | packet count (u8) | packets...
//! ```
//!
//! Blocks are written in increasing "logical recency" order even when the ids
//!  in one datagram span a wrap of the 16-bit sequence space (65530 is written
//!  before 3).
//!
//! ## Per-connection flow
//!
//! Send side, once per tick: enqueue messages through
//!  [`super_packet::SuperPacket`], then call `finish()` to assemble the
//!  outgoing datagram. Receive side: feed each raw datagram to
//!  [`protocol::Protocol::read`], which validates the sequence id, replays
//!  embedded acks into the send-side queues, suppresses duplicates and
//!  dispatches application packets to a [`handler::PacketHandler`]. Both sides
//!  of a connection are owned by that connection exclusively; nothing here
//!  locks, and connections can be processed fully in parallel. The one shared
//!  resource is the [`packet_pool::PacketPool`].

pub mod buffers;
pub mod config;
pub mod handler;
pub mod packers;
pub mod packet;
pub mod packet_pool;
pub mod packet_reader;
pub mod protocol;
pub mod queues;
pub mod seq;
pub mod super_packet;
pub mod super_packet_reader;
