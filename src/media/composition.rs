//! The outgoing track set
//!
//! A [`Composition`] is immutable. Every recompute builds a new one with a
//! higher revision; nothing patches an existing composition in place.
//!
//! Track order on the wire is fixed:
//!
//! ```text
//! [ primary video, secondary (PiP) video?, audio? ]
//! ```
//!
//! so a viewer can tell the primary picture from the PiP by position.

use super::track::{MediaTrack, TrackKind};

/// Position of a sender in the outgoing track set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SenderSlot {
    PrimaryVideo,
    SecondaryVideo,
    Audio,
}

impl SenderSlot {
    /// All slots in wire order
    pub const ALL: [SenderSlot; 3] = [
        SenderSlot::PrimaryVideo,
        SenderSlot::SecondaryVideo,
        SenderSlot::Audio,
    ];

    pub fn kind(self) -> TrackKind {
        match self {
            SenderSlot::PrimaryVideo | SenderSlot::SecondaryVideo => TrackKind::Video,
            SenderSlot::Audio => TrackKind::Audio,
        }
    }
}

/// Current outgoing track set
#[derive(Debug, Clone)]
pub struct Composition {
    revision: u64,
    primary: MediaTrack,
    secondary: Option<MediaTrack>,
    audio: Option<MediaTrack>,
}

impl Composition {
    pub fn new(
        revision: u64,
        primary: MediaTrack,
        secondary: Option<MediaTrack>,
        audio: Option<MediaTrack>,
    ) -> Self {
        debug_assert_eq!(primary.kind(), TrackKind::Video);
        debug_assert!(secondary.as_ref().map_or(true, |t| t.kind() == TrackKind::Video));
        debug_assert!(audio.as_ref().map_or(true, |t| t.kind() == TrackKind::Audio));

        Self {
            revision,
            primary,
            secondary,
            audio,
        }
    }

    /// Monotonic revision assigned by the engine
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn primary(&self) -> &MediaTrack {
        &self.primary
    }

    pub fn secondary(&self) -> Option<&MediaTrack> {
        self.secondary.as_ref()
    }

    pub fn audio(&self) -> Option<&MediaTrack> {
        self.audio.as_ref()
    }

    /// Track occupying `slot`, if any
    pub fn track(&self, slot: SenderSlot) -> Option<&MediaTrack> {
        match slot {
            SenderSlot::PrimaryVideo => Some(&self.primary),
            SenderSlot::SecondaryVideo => self.secondary.as_ref(),
            SenderSlot::Audio => self.audio.as_ref(),
        }
    }

    /// Occupied slots in wire order
    pub fn slots(&self) -> impl Iterator<Item = (SenderSlot, &MediaTrack)> {
        SenderSlot::ALL
            .into_iter()
            .filter_map(move |slot| self.track(slot).map(|track| (slot, track)))
    }

    /// Tracks in wire order
    pub fn tracks(&self) -> Vec<&MediaTrack> {
        self.slots().map(|(_, track)| track).collect()
    }

    pub fn video_count(&self) -> usize {
        1 + self.secondary.is_some() as usize
    }

    /// Whether both compositions carry the same tracks in the same slots
    pub fn same_tracks(&self, other: &Composition) -> bool {
        SenderSlot::ALL
            .into_iter()
            .all(|slot| self.track(slot) == other.track(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::track::SourceKind;

    #[test]
    fn test_wire_order() {
        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        let camera = MediaTrack::new(SourceKind::Camera, "cam");
        let mix = MediaTrack::new(SourceKind::Mix, "mix");

        let comp = Composition::new(1, screen.clone(), Some(camera.clone()), Some(mix.clone()));
        assert_eq!(comp.tracks(), vec![&screen, &camera, &mix]);
        assert_eq!(comp.video_count(), 2);

        let slots: Vec<_> = comp.slots().map(|(slot, _)| slot).collect();
        assert_eq!(
            slots,
            vec![SenderSlot::PrimaryVideo, SenderSlot::SecondaryVideo, SenderSlot::Audio]
        );
    }

    #[test]
    fn test_optional_slots() {
        let camera = MediaTrack::new(SourceKind::Camera, "cam");
        let comp = Composition::new(1, camera.clone(), None, None);

        assert_eq!(comp.tracks(), vec![&camera]);
        assert!(comp.track(SenderSlot::Audio).is_none());
        assert_eq!(comp.video_count(), 1);
    }

    #[test]
    fn test_same_tracks_ignores_revision() {
        let camera = MediaTrack::new(SourceKind::Camera, "cam");
        let mic = MediaTrack::new(SourceKind::Microphone, "mic");

        let a = Composition::new(1, camera.clone(), None, Some(mic.clone()));
        let b = Composition::new(2, camera.clone(), None, Some(mic));
        let c = Composition::new(3, camera, None, None);

        assert!(a.same_tracks(&b));
        assert!(!a.same_tracks(&c));
    }
}
