//! Session registry configuration

use std::time::Duration;

/// Session registry configuration options
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How long a disconnected session may try to recover before it fails
    pub recovery_window: Duration,

    /// How long an offer may go unanswered before the session fails
    pub negotiation_timeout: Duration,

    /// Cooldown before the first rebuild of a failed session
    pub rebuild_cooldown: Duration,

    /// Upper bound for the rebuild cooldown
    pub rebuild_max_cooldown: Duration,

    /// Rebuilds allowed before a repeatedly failing session is closed
    pub max_rebuild_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            recovery_window: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(15),
            rebuild_cooldown: Duration::from_secs(2),
            rebuild_max_cooldown: Duration::from_secs(30),
            max_rebuild_attempts: 3,
        }
    }
}

impl RegistryConfig {
    /// Set the recovery window (disconnected -> failed)
    pub fn recovery_window(mut self, window: Duration) -> Self {
        self.recovery_window = window;
        self
    }

    /// Set the answer deadline for every offer
    pub fn negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the rebuild cooldown (base delay and cap)
    pub fn rebuild_cooldown(mut self, base: Duration, max: Duration) -> Self {
        self.rebuild_cooldown = base;
        self.rebuild_max_cooldown = max.max(base);
        self
    }

    /// Set the rebuild bound
    pub fn max_rebuild_attempts(mut self, attempts: u32) -> Self {
        self.max_rebuild_attempts = attempts;
        self
    }
}
