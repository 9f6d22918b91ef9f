use std::time::Duration;

use anyhow::bail;

/// Tunables of the circuit engine. [`EngineConfig::default`] matches the behavior
///  of mainline viewers; [`validate`](EngineConfig::validate) is called once when
///  the engine is built.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// a simulator that misses pings for this long is a disconnect candidate
    pub simulator_timeout: Duration,

    /// interval between outgoing ping probes
    pub ping_interval: Duration,

    /// how long to wait for `LogoutReply` before forcing the circuit closed
    pub logout_timeout: Duration,

    /// how long a circuit may stay in `Handshaking` before giving up
    pub handshake_timeout: Duration,

    /// send a periodic `AgentUpdate` once the handshake completes
    pub send_agent_updates: bool,
    pub agent_update_interval: Duration,

    /// advertise the bandwidth throttle vector right after connecting
    pub send_agent_throttle: bool,

    /// act on `EnableSimulator` by opening a circuit to the announced neighbour
    pub multiple_sims: bool,

    /// initial retransmission timeout, used until a ping lag measurement exists
    pub resend_timeout: Duration,

    /// a reliable packet is retransmitted at most this many times before the
    ///  circuit is declared dead
    pub max_resend_attempts: u32,

    /// pending acks are flushed as an explicit ack packet at least this often
    pub ack_flush_interval: Duration,

    /// an explicit ack packet goes out early once this many acks are pending
    pub ack_batch_threshold: usize,

    /// cadence of the timer/maintenance pump, and the upper bound on how long a
    ///  socket read may block
    pub poll_interval: Duration,

    /// entries retained in the inbound duplicate-detection set
    pub dedup_capacity: usize,

    /// total bytes/sec advertised across the seven throttle channels
    pub throttle_total: f32,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            simulator_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(5),
            logout_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(100),
            send_agent_updates: true,
            agent_update_interval: Duration::from_millis(500),
            send_agent_throttle: true,
            multiple_sims: true,
            resend_timeout: Duration::from_millis(4000),
            max_resend_attempts: 3,
            ack_flush_interval: Duration::from_millis(500),
            ack_batch_threshold: 10,
            poll_interval: Duration::from_millis(100),
            dedup_capacity: 1000,
            throttle_total: crate::circuit::ThrottleRates::DEFAULT_TOTAL,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dedup_capacity < 1000 {
            bail!("dedup capacity below 1000 makes replayed packets dispatch twice");
        }
        if self.ack_flush_interval > Duration::from_millis(500) {
            bail!("ack flush interval must stay at or below 500 ms");
        }
        if self.poll_interval.is_zero() {
            bail!("poll interval must be non-zero");
        }
        if self.max_resend_attempts == 0 {
            bail!("at least one resend attempt is required");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_small_dedup() {
        let config = EngineConfig {
            dedup_capacity: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_ack_flush() {
        let config = EngineConfig {
            ack_flush_interval: Duration::from_secs(2),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
