use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for one link. Everything here is fixed at construction; the
///  fragment size is the one exception, mutable at runtime through the
///  connection (the console's `SIZE` directive) because it is handy to shrink
///  fragments mid-session when a route turns out to be lossy.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound on every wait for an inbound segment. A stream routine
    ///  that waits longer than this treats the exchange as unanswered and
    ///  either retries or gives up, so this is effectively the protocol's
    ///  retry interval.
    pub receive_timeout: Duration,

    /// How many times a control message is re-sent without a correctly
    ///  ordered reply before the exchange is declared dead. Exhausting this
    ///  budget tears the connection down.
    pub repeat_limit: u32,

    /// Payload size for text chunks and file fragments. Must fit the 16-bit
    ///  wire length field; keeping it comfortably below the path MTU avoids
    ///  IP fragmentation, which this protocol does nothing to handle.
    pub fragment_size: usize,

    /// Number of ack rounds an upload fragment survives unacknowledged
    ///  before it is retransmitted.
    pub fragment_max_age: u32,

    /// W, the upload window: the maximum number of unacknowledged fragments
    ///  in flight at once. Doubles as the per-round send budget.
    pub window_size: usize,

    /// Keep-alive probe interval. After this much inbound silence the
    ///  connection pings the peer on a fresh stream; after twice this much
    ///  it gives up and closes.
    pub ping_interval: Duration,

    /// Extra duplicate transmissions for every Text message and Data
    ///  fragment, on top of the one regular send. A blunt instrument against
    ///  loss on terrible links; 0 for normal operation.
    pub force_repeat: u32,
}

impl LinkConfig {
    /// Largest payload the 16-bit wire length field can express.
    pub const MAX_FRAGMENT_SIZE: usize = u16::MAX as usize;

    pub fn new() -> LinkConfig {
        LinkConfig {
            receive_timeout: Duration::from_secs(1),
            repeat_limit: 5,
            fragment_size: 1024,
            fragment_max_age: 2,
            window_size: 10,
            ping_interval: Duration::from_secs(5),
            force_repeat: 0,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fragment_size == 0 {
            bail!("fragment size must be positive");
        }
        if self.fragment_size > Self::MAX_FRAGMENT_SIZE {
            bail!("fragment size {} exceeds the 16-bit wire length field", self.fragment_size);
        }
        if self.window_size == 0 {
            bail!("window size must be positive");
        }
        if self.repeat_limit == 0 {
            bail!("repeat limit must be positive");
        }
        if self.receive_timeout.is_zero() {
            bail!("receive timeout must be positive");
        }
        if self.ping_interval.is_zero() {
            bail!("ping interval must be positive");
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(LinkConfig::new().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_degenerate_values() {
        let mut config = LinkConfig::new();
        config.fragment_size = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::new();
        config.fragment_size = LinkConfig::MAX_FRAGMENT_SIZE + 1;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::new();
        config.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::new();
        config.repeat_limit = 0;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::new();
        config.receive_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = LinkConfig::new();
        config.ping_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
