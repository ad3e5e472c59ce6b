//! Collaborators that produce media
//!
//! The composition engine never talks to devices directly. Capture, display
//! capture, audio mixing and the placeholder renderer are supplied by the
//! embedding application (or by the fakes in [`crate::testing`]).

use async_trait::async_trait;

use crate::error::Result;

use super::track::MediaTrack;

/// Opens camera and microphone devices
#[async_trait]
pub trait CaptureProvider: Send + Sync + 'static {
    /// Open a camera; `None` selects the default device
    async fn open_camera(&self, device_id: Option<&str>) -> Result<MediaTrack>;

    /// Open a microphone; `None` selects the default device
    async fn open_microphone(&self, device_id: Option<&str>) -> Result<MediaTrack>;
}

/// A screen share: video plus optional system audio
#[derive(Debug, Clone)]
pub struct DisplayCapture {
    pub video: MediaTrack,
    pub audio: Option<MediaTrack>,
}

impl DisplayCapture {
    /// Stop every track of the capture
    pub fn stop(&self) {
        self.video.stop();
        if let Some(audio) = &self.audio {
            audio.stop();
        }
    }
}

/// Opens a screen/window capture
#[async_trait]
pub trait DisplayCaptureProvider: Send + Sync + 'static {
    async fn open_display(&self) -> Result<DisplayCapture>;
}

/// A built audio mixing graph
///
/// Owns the connections from its inputs to `output`; [`MixGraph::teardown`]
/// disconnects them and stops the output track.
pub struct MixGraph {
    output: MediaTrack,
    teardown: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl MixGraph {
    /// Wrap a mixer output together with its teardown routine
    pub fn new(output: MediaTrack, teardown: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            output,
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn output(&self) -> &MediaTrack {
        &self.output
    }

    /// Disconnect the graph and stop its output
    pub fn teardown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
        self.output.stop();
    }
}

impl Drop for MixGraph {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for MixGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MixGraph")
            .field("output", &self.output.id())
            .finish()
    }
}

/// Connects several audio tracks into one output track
pub trait AudioMixer: Send + Sync + 'static {
    fn mix(&self, inputs: &[MediaTrack]) -> Result<MixGraph>;
}

/// Produces the stand-in video shown when nothing else is on screen
pub trait PlaceholderSource: Send + Sync + 'static {
    fn create(&self) -> MediaTrack;
}
