//! Media transport seam
//!
//! A [`PeerTransport`] is one real-time media connection to one viewer. The
//! crate never looks inside offers, answers or candidates; it only drives the
//! sender set and relays the payloads over signaling.
//!
//! Every transport is created for a `(viewer, generation)` pair. Events it
//! reports carry that pair so events from a transport that has since been
//! rebuilt can be recognised and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::ids::ViewerId;
use crate::media::{MediaTrack, SenderSlot};
use crate::signaling::{IceCandidate, SessionDescription};

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What a transport reported
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEventKind {
    /// A local ICE candidate to relay to the viewer
    LocalCandidate(IceCandidate),
    /// Connectivity changed
    ConnectionState(PeerConnectionState),
}

/// An event from one transport generation
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub viewer: ViewerId,
    pub generation: u64,
    pub kind: PeerEventKind,
}

/// Handed to a transport at creation; reports its events to the registry
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    viewer: ViewerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEventSink {
    pub fn new(viewer: ViewerId, generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            viewer,
            generation,
            tx,
        }
    }

    pub fn viewer(&self) -> &ViewerId {
        &self.viewer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a gathered local candidate
    pub fn local_candidate(&self, candidate: IceCandidate) {
        self.emit(PeerEventKind::LocalCandidate(candidate));
    }

    /// Report a connectivity change
    pub fn connection_state(&self, state: PeerConnectionState) {
        self.emit(PeerEventKind::ConnectionState(state));
    }

    fn emit(&self, kind: PeerEventKind) {
        // The registry may already be gone during shutdown
        let _ = self.tx.send(PeerEvent {
            viewer: self.viewer.clone(),
            generation: self.generation,
            kind,
        });
    }
}

/// One media connection to a viewer
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Add a sender for `slot` carrying `track`
    async fn add_sender(&self, slot: SenderSlot, track: &MediaTrack) -> Result<()>;

    /// Swap the track of an existing sender without changing topology
    async fn replace_track(&self, slot: SenderSlot, track: &MediaTrack) -> Result<()>;

    /// Remove the sender for `slot`
    async fn remove_sender(&self, slot: SenderSlot) -> Result<()>;

    /// Create a fresh offer reflecting the current senders
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Apply the viewer's answer
    async fn apply_answer(&self, answer: SessionDescription) -> Result<()>;

    /// Apply a candidate received from the viewer
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

/// Allocates transports
#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>>;
}
