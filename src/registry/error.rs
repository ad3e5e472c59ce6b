//! Registry error types
//!
//! Error types for session registry operations.

use crate::ids::ViewerId;
use crate::session::SessionState;

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session for this viewer
    SessionNotFound(ViewerId),
    /// The state machine does not allow this transition
    IllegalTransition {
        viewer: ViewerId,
        from: SessionState,
        to: SessionState,
    },
    /// Rebuild requested for a session that has not failed
    NotFailed(ViewerId, SessionState),
    /// The session used up its rebuilds and was closed
    RebuildsExhausted(ViewerId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::SessionNotFound(viewer) => write!(f, "Session not found: {}", viewer),
            RegistryError::IllegalTransition { viewer, from, to } => {
                write!(f, "Illegal transition for {}: {} -> {}", viewer, from, to)
            }
            RegistryError::NotFailed(viewer, state) => {
                write!(f, "Session {} is {}, not failed", viewer, state)
            }
            RegistryError::RebuildsExhausted(viewer) => {
                write!(f, "Session {} exhausted its rebuilds", viewer)
            }
        }
    }
}

impl std::error::Error for RegistryError {}
