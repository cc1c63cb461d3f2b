use anyhow::bail;
use std::time::Duration;

/// Tuning knobs shared by listeners and dialers. The defaults are the protocol's
///  suggested values; deployments on lossy or low-latency paths typically shrink the
///  retransmission interval.
pub struct TransportConfig {
    /// Interval of the per-session retransmission tick. Each tick rewinds the send
    ///  cursor to the last acknowledged offset, so everything the peer has not
    ///  acknowledged yet is sent again (and a client that is still waiting for the
    ///  acknowledgement of its initial connect re-sends the connect instead).
    pub retransmit_interval: Duration,

    /// How long a session waits for a valid frame from its peer before accepting that
    ///  the peer has disappeared and tearing the session down.
    pub inactivity_timeout: Duration,

    /// Capacity of the queue between the listener's receive loop and `accept`. A
    ///  connect that arrives while the queue is full has its freshly created session
    ///  discarded without any response, leaving the peer's retry to succeed later.
    ///  The protocol requires support for at least 20 simultaneous pending sessions.
    pub accept_backlog: usize,

    /// Capacity of the per-session receive queue between the demux loop and the
    ///  session's read worker. Frames arriving while the queue is full are dropped;
    ///  the peer's retransmission covers the loss. Sizing this up mostly helps
    ///  throughput on paths with heavy reordering.
    pub receive_queue_capacity: usize,

    /// Number of frame encode buffers kept pooled per listener / dialer - buffers in
    ///  excess of this number are discarded when they are returned.
    pub buffer_pool_size: usize,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            retransmit_interval: Duration::from_secs(3),
            inactivity_timeout: Duration::from_secs(60),
            accept_backlog: 20,
            receive_queue_capacity: 16,
            buffer_pool_size: 64,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.retransmit_interval.is_zero() {
            bail!("retransmission interval must not be zero");
        }
        if self.inactivity_timeout.is_zero() {
            bail!("inactivity timeout must not be zero");
        }
        if self.accept_backlog < 20 {
            bail!("accept backlog of {} is below the protocol minimum of 20", self.accept_backlog);
        }
        if self.receive_queue_capacity == 0 {
            bail!("receive queue capacity must not be zero");
        }
        Ok(())
    }
}
