//! Local media
//!
//! This module provides:
//! - Track handles with liveness tracking
//! - Capture, display, mixer and placeholder collaborator traits
//! - The immutable outgoing [`Composition`]
//! - The [`CompositionEngine`] that derives compositions from local toggles

pub mod composition;
pub mod engine;
pub mod provider;
pub mod track;

pub use composition::{Composition, SenderSlot};
pub use engine::{CompositionEngine, MediaSources};
pub use provider::{
    AudioMixer, CaptureProvider, DisplayCapture, DisplayCaptureProvider, MixGraph,
    PlaceholderSource,
};
pub use track::{MediaTrack, SourceKind, TrackId, TrackKind};
