//! Viewer sessions
//!
//! This module provides:
//! - The per-viewer state machine
//! - The media transport seam ([`PeerTransport`], [`PeerFactory`])
//! - [`ConsumerSession`], one viewer's transport plus renegotiation bookkeeping

pub mod consumer;
pub mod peer;
pub mod state;

pub use consumer::ConsumerSession;
pub use peer::{
    PeerConnectionState, PeerEvent, PeerEventKind, PeerEventSink, PeerFactory, PeerTransport,
};
pub use state::SessionState;
