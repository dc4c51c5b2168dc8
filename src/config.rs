use anyhow::bail;
use std::time::Duration;

/// Per-connection protocol tuning. All windows are counted in *ticks* (i.e.
///  in sequence ids), not in wall-clock time - the only wall-clock value is
///  [`tick_interval`](ProtocolConfig::tick_interval), which is used purely to
///  interpolate receive timestamps for presentation and physics.
pub struct ProtocolConfig {
    /// Number of ticks an unacknowledged entry may remain outstanding before
    ///  it is forcibly re-included in an outgoing datagram.
    ///
    /// Choosing this too small wastes bandwidth on retransmissions that would
    ///  have been acknowledged anyway; choosing it too large delays recovery
    ///  after a lost datagram by the same number of ticks. A reasonable
    ///  starting point is slightly above the expected round trip expressed in
    ///  ticks.
    pub resend_threshold: u16,

    /// Number of trailing sequence ids for which duplicate-suppression state
    ///  is retained on the receive side. Retransmissions arriving later than
    ///  this window can be dispatched twice; it must therefore comfortably
    ///  exceed `resend_threshold` times the number of retries worth caring
    ///  about.
    pub resync_threshold: u16,

    /// Ticks without any accepted datagram before the connection is reported
    ///  dead. What to do with a dead connection is the caller's decision.
    pub disconnect_threshold: u16,

    /// Ticks without an outgoing datagram before an empty one is forced out
    ///  anyway, keeping the peer's liveness window open.
    pub ping_interval: u16,

    /// Transmissions granted to entries in the unreliable queue. 0 means
    ///  fire-and-forget: entries are dropped right after their first chance
    ///  to be embedded.
    pub max_unreliable_retries: usize,

    /// Wall-clock duration of one tick, for receive-timestamp interpolation
    ///  only. The protocol itself never looks at a clock.
    pub tick_interval: Duration,

    /// Upper bound on packets alive at any one time across the connections
    ///  sharing one pool.
    pub pool_capacity: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            resend_threshold: 5,
            resync_threshold: 256,
            disconnect_threshold: 300,
            ping_interval: 20,
            max_unreliable_retries: 0,
            tick_interval: Duration::from_millis(50),
            pool_capacity: 1024,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.resend_threshold == 0 {
            bail!("resend threshold must be at least one tick");
        }
        if self.resync_threshold == 0 {
            bail!("resync threshold must be at least one tick");
        }
        if self.resync_threshold >= u16::MAX / 2 {
            bail!("resync threshold must stay below the sequence comparison threshold");
        }
        if self.disconnect_threshold == 0 {
            bail!("disconnect threshold must be at least one tick");
        }
        if self.ping_interval == 0 {
            bail!("ping interval must be at least one tick");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be non-zero");
        }
        if self.pool_capacity == 0 {
            bail!("packet pool capacity must be non-zero");
        }
        Ok(())
    }
}
