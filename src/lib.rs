//! # castline
//!
//! Core of a one-to-many live broadcast: one producer captures camera,
//! microphone and optionally a shared screen, and streams the result to many
//! viewers over individually negotiated peer transports.
//!
//! ```text
//!   CompositionEngine ──watch──► RenegotiationCoordinator
//!   (camera, mic, screen)                 │
//!                                         ▼
//!   SignalingChannel ◄──offers/ICE── SessionRegistry ──► ConsumerSession × N
//!   (endpoints, queue)  ──answers──►                        (PeerTransport)
//! ```
//!
//! The media stack and the capture devices sit behind traits
//! ([`session::PeerTransport`], [`media::CaptureProvider`] and friends);
//! [`testing`] carries in-memory implementations of all of them.

pub mod broadcaster;
pub mod error;
pub mod ids;
pub mod media;
pub mod registry;
pub mod renegotiate;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod testing;

pub(crate) mod task;

pub use broadcaster::{Broadcaster, BroadcasterConfig, Collaborators, StreamObserver};
pub use error::{Error, Result};
pub use ids::{BroadcasterId, ViewerId};
pub use media::{Composition, CompositionEngine, MediaSources};
pub use registry::{RegistryConfig, SessionRegistry};
pub use signaling::{ChannelConfig, ChannelState, SignalingChannel};
