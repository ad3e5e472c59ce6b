//! Viewer session state machine
//!
//! ```text
//! Created ──► Negotiating ──► Connected ◄──► Disconnected
//!    ▲             │              │               │
//!    │             └──────────────┴───► Failed ◄──┘
//!    └──────────── (rebuild) ─────────────┘
//!
//! any state ──► Closed (terminal)
//! ```

/// Connection state of one viewer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Transport allocated, no offer sent yet
    Created,
    /// Offer sent, waiting for the media path to come up
    Negotiating,
    /// Media is flowing
    Connected,
    /// Connectivity lost, inside the recovery window
    Disconnected,
    /// Recovery window exceeded or negotiation failed; waiting for a rebuild
    Failed,
    /// Terminal; the session has been removed
    Closed,
}

impl SessionState {
    /// Whether no further transition is possible
    pub fn is_terminal(self) -> bool {
        self == SessionState::Closed
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Created, Negotiating) => true,
            (Created, Failed) => true,
            (Negotiating, Connected) => true,
            (Negotiating, Failed) => true,
            (Connected, Disconnected) => true,
            (Connected, Failed) => true,
            (Disconnected, Connected) => true,
            (Disconnected, Failed) => true,
            (Failed, Created) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    const ALL: [SessionState; 6] = [Created, Negotiating, Connected, Disconnected, Failed, Closed];

    #[test]
    fn test_happy_path() {
        assert!(Created.can_transition_to(Negotiating));
        assert!(Negotiating.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(Connected));
        assert!(Disconnected.can_transition_to(Failed));
    }

    #[test]
    fn test_failed_only_leaves_through_rebuild_or_close() {
        for next in ALL {
            let legal = Failed.can_transition_to(next);
            assert_eq!(legal, matches!(next, Created | Closed), "failed -> {}", next);
        }
    }

    #[test]
    fn test_closed_is_terminal() {
        assert!(Closed.is_terminal());
        for next in ALL {
            assert!(!Closed.can_transition_to(next));
        }
        for state in &ALL[..5] {
            assert!(state.can_transition_to(Closed));
            assert!(!state.is_terminal());
        }
    }

    #[test]
    fn test_no_shortcuts() {
        assert!(!Created.can_transition_to(Connected));
        assert!(!Negotiating.can_transition_to(Disconnected));
        assert!(!Connected.can_transition_to(Negotiating));
        assert!(!Disconnected.can_transition_to(Created));
    }
}
