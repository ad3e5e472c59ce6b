//! Statistics for the signaling channel and viewer sessions

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::ids::ViewerId;
use crate::session::SessionState;

/// Channel-level statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Messages written directly to a live link
    pub messages_sent: u64,
    /// Messages queued because no link was up
    pub messages_queued: u64,
    /// Queued messages written after a reconnect
    pub messages_flushed: u64,
    /// Undelivered offers superseded by a newer offer
    pub offers_replaced: u64,
    /// Queued messages dropped because their session closed
    pub messages_discarded: u64,
    /// Reconnect passes scheduled after unexpected closes
    pub reconnects: u64,
}

/// Live counters behind [`ChannelStats`]
#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    pub sent: AtomicU64,
    pub queued: AtomicU64,
    pub flushed: AtomicU64,
    pub replaced: AtomicU64,
    pub discarded: AtomicU64,
    pub reconnects: AtomicU64,
}

impl ChannelCounters {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.sent.load(Ordering::Relaxed),
            messages_queued: self.queued.load(Ordering::Relaxed),
            messages_flushed: self.flushed.load(Ordering::Relaxed),
            offers_replaced: self.replaced.load(Ordering::Relaxed),
            messages_discarded: self.discarded.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one viewer session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Viewer id
    pub viewer: ViewerId,
    /// Current state
    pub state: SessionState,
    /// Transport generation (bumped on every rebuild)
    pub generation: u64,
    /// Revision of the last composition applied to the senders
    pub applied_revision: Option<u64>,
    /// Offers created for this viewer (across rebuilds)
    pub offers_sent: u64,
    /// Rebuilds performed since the session last reached `connected`
    pub rebuild_attempts: u32,
    /// Time spent in the current state
    pub in_state_for: Duration,
}

/// Broadcaster-wide snapshot
#[derive(Debug, Clone)]
pub struct BroadcastStats {
    pub channel: ChannelStats,
    /// Sorted by viewer id
    pub sessions: Vec<SessionInfo>,
}

impl BroadcastStats {
    /// Number of sessions in `state`
    pub fn count(&self, state: SessionState) -> usize {
        self.sessions.iter().filter(|s| s.state == state).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_snapshot() {
        let counters = ChannelCounters::default();
        ChannelCounters::add(&counters.sent, 3);
        ChannelCounters::add(&counters.queued, 2);
        ChannelCounters::add(&counters.flushed, 2);

        let stats = counters.snapshot();
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_queued, 2);
        assert_eq!(stats.messages_flushed, 2);
        assert_eq!(stats.reconnects, 0);
    }

    #[test]
    fn test_broadcast_count_by_state() {
        let info = |id: &str, state| SessionInfo {
            viewer: ViewerId::new(id),
            state,
            generation: 1,
            applied_revision: None,
            offers_sent: 0,
            rebuild_attempts: 0,
            in_state_for: Duration::ZERO,
        };
        let stats = BroadcastStats {
            channel: ChannelStats::default(),
            sessions: vec![
                info("a", SessionState::Connected),
                info("b", SessionState::Failed),
                info("c", SessionState::Connected),
            ],
        };
        assert_eq!(stats.count(SessionState::Connected), 2);
        assert_eq!(stats.count(SessionState::Negotiating), 0);
    }
}
