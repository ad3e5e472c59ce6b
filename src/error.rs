//! Error types
//!
//! Every failure is contained at the smallest scope it occurs in. Only
//! [`Error::TransportUnavailable`] is meant to reach the application layer;
//! the other variants are returned to direct callers (or logged and absorbed
//! by background tasks).

use thiserror::Error;

use crate::ids::ViewerId;
use crate::registry::RegistryError;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for broadcast operations
#[derive(Debug, Error)]
pub enum Error {
    /// Every signaling endpoint was tried and none accepted a connection
    #[error("signaling unavailable: all {attempted} endpoint(s) failed")]
    TransportUnavailable {
        /// Number of endpoints attempted in the final pass
        attempted: usize,
    },

    /// An established signaling link dropped
    #[error("signaling interrupted: {0}")]
    TransportInterrupted(String),

    /// Media negotiation with one viewer failed
    #[error("negotiation failed for viewer {viewer}: {reason}")]
    SessionNegotiationFailed {
        /// Viewer whose session failed
        viewer: ViewerId,
        /// Underlying cause
        reason: String,
    },

    /// A capture device was denied or missing
    #[error("device acquisition failed ({device}): {reason}")]
    DeviceAcquisitionFailed {
        /// Device id, or the source kind when no id was requested
        device: String,
        /// Underlying cause
        reason: String,
    },

    /// The underlying media stack rejected an operation
    #[error("peer error: {0}")]
    Peer(String),

    /// Registry rejected an operation
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Signaling payload could not be encoded or decoded
    #[error("signaling codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// I/O error on a transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation requires an active broadcast
    #[error("not broadcasting")]
    NotBroadcasting,

    /// No composition has been built yet (preview not started)
    #[error("no composition available")]
    NoComposition,

    /// Sources were shut down; start a preview again first
    #[error("media sources shut down")]
    ShutDown,
}

impl Error {
    /// Create a device acquisition error
    pub fn device(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::DeviceAcquisitionFailed {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a negotiation failure for a viewer
    pub fn negotiation(viewer: &ViewerId, reason: impl std::fmt::Display) -> Self {
        Error::SessionNegotiationFailed {
            viewer: viewer.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error should be escalated to the application layer
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::TransportUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_terminal() {
        assert!(Error::TransportUnavailable { attempted: 2 }.is_terminal());
        assert!(!Error::TransportInterrupted("reset".into()).is_terminal());
        assert!(!Error::negotiation(&ViewerId::new("v1"), "ice failed").is_terminal());
        assert!(!Error::device("cam0", "denied").is_terminal());
    }

    #[test]
    fn test_display() {
        let err = Error::negotiation(&ViewerId::new("v9"), "ice failed");
        assert_eq!(err.to_string(), "negotiation failed for viewer v9: ice failed");

        let err = Error::TransportUnavailable { attempted: 3 };
        assert_eq!(err.to_string(), "signaling unavailable: all 3 endpoint(s) failed");
    }
}
