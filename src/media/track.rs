//! Live media track handles
//!
//! A [`MediaTrack`] is a cheap, clonable handle to one capture output. Two
//! handles are the same track iff their [`TrackId`]s match. Liveness is a
//! `watch` flag: stopping a track (by its owner, or by the source itself, e.g.
//! the user ending a screen share from the OS picker) flips it once and wakes
//! every [`MediaTrack::ended`] waiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique track identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(u64);

impl TrackId {
    fn next() -> Self {
        Self(NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track#{}", self.0)
    }
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// Camera device
    Camera,
    /// Microphone device
    Microphone,
    /// Screen/window capture video
    Screen,
    /// Audio captured alongside a screen share
    ScreenAudio,
    /// Synthetic, continuously redrawn stand-in video
    Placeholder,
    /// Output of the audio mixing graph
    Mix,
}

impl SourceKind {
    /// Track kind produced by this source
    pub fn track_kind(self) -> TrackKind {
        match self {
            SourceKind::Camera | SourceKind::Screen | SourceKind::Placeholder => TrackKind::Video,
            SourceKind::Microphone | SourceKind::ScreenAudio | SourceKind::Mix => TrackKind::Audio,
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: TrackId,
    source: SourceKind,
    label: String,
    live: watch::Sender<bool>,
}

/// Handle to a live capture output
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live track
    pub fn new(source: SourceKind, label: impl Into<String>) -> Self {
        let (live, _) = watch::channel(true);
        Self {
            inner: Arc::new(TrackInner {
                id: TrackId::next(),
                source,
                label: label.into(),
                live,
            }),
        }
    }

    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.source.track_kind()
    }

    pub fn source(&self) -> SourceKind {
        self.inner.source
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Whether the track is still producing media
    pub fn is_live(&self) -> bool {
        *self.inner.live.borrow()
    }

    /// Stop the track. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        self.inner.live.send_if_modified(|live| std::mem::replace(live, false))
    }

    /// Resolve once the track has stopped
    pub async fn ended(&self) {
        let mut rx = self.inner.live.subscribe();
        // Err only if the sender is gone, which cannot happen while `self` holds it
        let _ = rx.wait_for(|live| !*live).await;
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_identity() {
        let a = MediaTrack::new(SourceKind::Camera, "cam");
        let b = MediaTrack::new(SourceKind::Camera, "cam");

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert_eq!(a.kind(), TrackKind::Video);
        assert_eq!(MediaTrack::new(SourceKind::Mix, "mix").kind(), TrackKind::Audio);
    }

    #[test]
    fn test_stop_once() {
        let track = MediaTrack::new(SourceKind::Microphone, "mic");
        assert!(track.is_live());
        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.is_live());
    }

    #[test]
    fn test_ended_wakes_on_stop() {
        let track = MediaTrack::new(SourceKind::Screen, "screen");
        let mut ended = task::spawn(track.ended());

        assert_pending!(ended.poll());
        track.clone().stop();
        assert!(ended.is_woken());
        assert_ready!(ended.poll());
    }

    #[test]
    fn test_ended_ready_when_already_stopped() {
        let track = MediaTrack::new(SourceKind::Screen, "screen");
        track.stop();

        let mut ended = task::spawn(track.ended());
        assert_ready!(ended.poll());
    }
}
