//! Optional observer for surrounding layers (UI, chat, effects)

use crate::ids::ViewerId;
use crate::media::Composition;
use crate::session::SessionState;
use crate::signaling::ChannelState;

/// Receives broadcaster notifications.
///
/// Every method has a no-op default; implement only what you need. Methods
/// are called from the broadcaster's event task and should return quickly.
pub trait StreamObserver: Send + Sync + 'static {
    /// The signaling channel changed state
    fn on_channel_state(&self, _state: &ChannelState) {}

    /// A viewer session changed state
    fn on_session_state(&self, _viewer: &ViewerId, _state: SessionState) {}

    /// Every signaling endpoint failed; nothing retries until `connect` is
    /// called again
    fn on_transport_unavailable(&self) {}

    /// A new composition became current
    fn on_composition(&self, _composition: &Composition) {}
}
