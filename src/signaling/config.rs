//! Signaling channel configuration

use std::time::Duration;

/// Signaling channel configuration options
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Time allowed for each candidate endpoint to accept a connection
    pub connect_timeout: Duration,

    /// Delay before the first reconnect after an unexpected close
    pub reconnect_base_delay: Duration,

    /// Upper bound for the reconnect delay
    pub reconnect_max_delay: Duration,

    /// A link that stayed up this long resets the backoff
    pub stable_link_threshold: Duration,

    /// Largest inbound message accepted by transports that enforce it
    pub max_message_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(10),
            stable_link_threshold: Duration::from_secs(30),
            max_message_size: 256 * 1024,
        }
    }
}

impl ChannelConfig {
    /// Set the per-candidate connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect backoff (base delay and cap)
    pub fn reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max.max(base);
        self
    }

    /// Set how long a link must stay up to reset the backoff
    pub fn stable_link_threshold(mut self, threshold: Duration) -> Self {
        self.stable_link_threshold = threshold;
        self
    }

    /// Set the maximum inbound message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}
