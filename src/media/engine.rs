//! Composition engine
//!
//! Owns every local source (camera, microphone, screen share, placeholder,
//! mix graph) and turns the current toggles into one [`Composition`]:
//!
//! 1. Primary video: the screen share if it is live, otherwise the camera if
//!    it is toggled on and live, otherwise the placeholder. There is always
//!    exactly one primary video track.
//! 2. Secondary (PiP) video: the camera, only while a screen share is the
//!    primary and the camera is toggled on and live.
//! 3. Audio: without a screen share, the microphone track itself. With a
//!    screen share, the output of a mix graph over every live audio input,
//!    rebuilt from scratch on recompute. Omitted when nothing is live.
//!
//! Turning the camera toggle off only drops it from the composition; the
//! device stays open so turning it back on is instant. Any source that ends
//! on its own (screen share closed by the OS, camera unplugged, microphone
//! permission revoked) triggers a recompute without any caller action: a
//! dead camera falls back to the placeholder, a dead microphone leaves the
//! audio path.
//!
//! Once shut down, every toggle fails with [`Error::ShutDown`] until a new
//! preview is started.
//!
//! Each new composition is published on a `watch` channel; the renegotiation
//! coordinator subscribes to it.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::composition::Composition;
use super::provider::{
    AudioMixer, CaptureProvider, DisplayCapture, DisplayCaptureProvider, MixGraph,
    PlaceholderSource,
};
use super::track::{MediaTrack, SourceKind, TrackId};

/// Media collaborators used by the engine
#[derive(Clone)]
pub struct MediaSources {
    pub capture: Arc<dyn CaptureProvider>,
    pub display: Arc<dyn DisplayCaptureProvider>,
    pub mixer: Arc<dyn AudioMixer>,
    pub placeholder: Arc<dyn PlaceholderSource>,
}

/// A source whose track is watched for ending on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watched {
    Camera,
    Microphone,
    Screen,
}

/// Whether a recompute may keep the current audio track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AudioPlan {
    /// Audio inputs changed: build the audio path from scratch
    Rebuild,
    /// Only video changed: keep the current audio track if it is still live
    Keep,
}

#[derive(Default)]
struct EngineState {
    camera: Option<MediaTrack>,
    camera_watch: Option<JoinHandle<()>>,
    camera_device: Option<String>,
    camera_on: bool,

    microphone: Option<MediaTrack>,
    microphone_watch: Option<JoinHandle<()>>,
    microphone_device: Option<String>,
    microphone_on: bool,

    screen: Option<DisplayCapture>,
    screen_watch: Option<JoinHandle<()>>,

    placeholder: Option<MediaTrack>,
    mix: Option<MixGraph>,

    revision: u64,
    shut_down: bool,
}

impl EngineState {
    fn check_running(&self) -> Result<()> {
        if self.shut_down {
            return Err(Error::ShutDown);
        }
        Ok(())
    }
}

struct EngineInner {
    sources: MediaSources,
    state: Mutex<EngineState>,
    current: watch::Sender<Option<Arc<Composition>>>,
}

/// Composition engine handle (cheap to clone)
#[derive(Clone)]
pub struct CompositionEngine {
    inner: Arc<EngineInner>,
}

impl CompositionEngine {
    pub fn new(sources: MediaSources) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            inner: Arc::new(EngineInner {
                sources,
                state: Mutex::new(EngineState::default()),
                current,
            }),
        }
    }

    /// Open the camera and microphone and build the first composition.
    ///
    /// A device that cannot be opened is left out (placeholder video, no
    /// audio) and the first such failure is returned after the degraded
    /// composition has been published.
    pub async fn start_preview(
        &self,
        camera_device: Option<&str>,
        microphone_device: Option<&str>,
    ) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.shut_down = false;
        state.camera_on = true;
        state.microphone_on = true;
        state.camera_device = camera_device.map(str::to_string);
        state.microphone_device = microphone_device.map(str::to_string);

        let mut failure = None;

        if !state.camera.as_ref().is_some_and(MediaTrack::is_live) {
            match self.inner.sources.capture.open_camera(camera_device).await {
                Ok(track) => self.install_camera(&mut state, Some(track)),
                Err(e) => {
                    tracing::warn!(device = ?camera_device, error = %e, "Camera unavailable, using placeholder");
                    self.install_camera(&mut state, None);
                    failure = Some(e);
                }
            }
        }

        if !state.microphone.as_ref().is_some_and(MediaTrack::is_live) {
            match self
                .inner
                .sources
                .capture
                .open_microphone(microphone_device)
                .await
            {
                Ok(track) => self.install_microphone(&mut state, Some(track)),
                Err(e) => {
                    tracing::warn!(device = ?microphone_device, error = %e, "Microphone unavailable, sending no audio");
                    self.install_microphone(&mut state, None);
                    failure.get_or_insert(e);
                }
            }
        }

        let composition = self.inner.recompute(&mut state, AudioPlan::Rebuild);
        match failure {
            Some(e) => Err(e),
            None => Ok(composition),
        }
    }

    /// Toggle the camera in or out of the composition.
    ///
    /// Turning it off never stops the device.
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.check_running()?;
        state.camera_on = enabled;

        let mut failure = None;
        if enabled && !state.camera.as_ref().is_some_and(MediaTrack::is_live) {
            let device = state.camera_device.clone();
            match self.inner.sources.capture.open_camera(device.as_deref()).await {
                Ok(track) => self.install_camera(&mut state, Some(track)),
                Err(e) => {
                    tracing::warn!(device = ?device, error = %e, "Camera unavailable");
                    failure = Some(e);
                }
            }
        }

        let composition = self.inner.recompute(&mut state, AudioPlan::Keep);
        match failure {
            Some(e) => Err(e),
            None => Ok(composition),
        }
    }

    /// Switch to another camera device.
    ///
    /// The new device is opened first; only on success is the old camera
    /// track stopped. Audio is left untouched.
    pub async fn switch_camera(&self, device_id: &str) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.check_running()?;

        let track = self
            .inner
            .sources
            .capture
            .open_camera(Some(device_id))
            .await?;

        self.install_camera(&mut state, Some(track));
        state.camera_device = Some(device_id.to_string());
        tracing::info!(device = device_id, "Camera switched");

        Ok(self.inner.recompute(&mut state, AudioPlan::Keep))
    }

    /// Toggle the microphone in or out of the audio path.
    ///
    /// Turning it off never stops the device.
    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.check_running()?;
        state.microphone_on = enabled;

        let mut failure = None;
        if enabled && !state.microphone.as_ref().is_some_and(MediaTrack::is_live) {
            let device = state.microphone_device.clone();
            match self
                .inner
                .sources
                .capture
                .open_microphone(device.as_deref())
                .await
            {
                Ok(track) => self.install_microphone(&mut state, Some(track)),
                Err(e) => {
                    tracing::warn!(device = ?device, error = %e, "Microphone unavailable");
                    failure = Some(e);
                }
            }
        }

        let composition = self.inner.recompute(&mut state, AudioPlan::Rebuild);
        match failure {
            Some(e) => Err(e),
            None => Ok(composition),
        }
    }

    /// Switch to another microphone; only the old microphone track is stopped
    pub async fn switch_microphone(&self, device_id: &str) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.check_running()?;

        let track = self
            .inner
            .sources
            .capture
            .open_microphone(Some(device_id))
            .await?;

        self.install_microphone(&mut state, Some(track));
        state.microphone_device = Some(device_id.to_string());
        tracing::info!(device = device_id, "Microphone switched");

        Ok(self.inner.recompute(&mut state, AudioPlan::Rebuild))
    }

    /// Start sharing the screen.
    ///
    /// When the share's video track ends by itself the engine recomputes back
    /// to camera/placeholder. Calling this while already sharing returns the
    /// current composition.
    pub async fn start_screen_share(&self) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.check_running()?;

        if state.screen.as_ref().is_some_and(|s| s.video.is_live()) {
            if let Some(current) = self.composition() {
                return Ok(current);
            }
        }

        let capture = self.inner.sources.display.open_display().await?;

        if let Some(watch) = state.screen_watch.take() {
            watch.abort();
        }
        state.screen_watch = Some(self.watch(Watched::Screen, &capture.video));
        if let Some(old) = state.screen.replace(capture) {
            old.stop();
        }

        tracing::info!("Screen share started");
        Ok(self.inner.recompute(&mut state, AudioPlan::Rebuild))
    }

    /// Stop sharing the screen
    pub async fn stop_screen_share(&self) -> Result<Arc<Composition>> {
        let mut state = self.inner.state.lock().await;
        state.check_running()?;

        if let Some(watch) = state.screen_watch.take() {
            watch.abort();
        }
        if let Some(capture) = state.screen.take() {
            capture.stop();
            tracing::info!("Screen share stopped");
        }

        Ok(self.inner.recompute(&mut state, AudioPlan::Rebuild))
    }

    /// Install `track` as the camera, stopping and unwatching the old one
    fn install_camera(&self, state: &mut EngineState, track: Option<MediaTrack>) {
        if let Some(watch) = state.camera_watch.take() {
            watch.abort();
        }
        state.camera_watch = track.as_ref().map(|t| self.watch(Watched::Camera, t));
        if let Some(old) = std::mem::replace(&mut state.camera, track) {
            old.stop();
        }
    }

    /// Install `track` as the microphone, stopping and unwatching the old one
    fn install_microphone(&self, state: &mut EngineState, track: Option<MediaTrack>) {
        if let Some(watch) = state.microphone_watch.take() {
            watch.abort();
        }
        state.microphone_watch = track.as_ref().map(|t| self.watch(Watched::Microphone, t));
        if let Some(old) = std::mem::replace(&mut state.microphone, track) {
            old.stop();
        }
    }

    /// Recompute once `track` ends by itself
    fn watch(&self, source: Watched, track: &MediaTrack) -> JoinHandle<()> {
        let engine = self.clone();
        let track = track.clone();
        tokio::spawn(async move {
            track.ended().await;
            engine.on_source_ended(source, track.id()).await;
        })
    }

    async fn on_source_ended(&self, source: Watched, id: TrackId) {
        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return;
        }

        // These run inside the watcher; detach rather than abort it
        let plan = match source {
            Watched::Camera => {
                if state.camera.as_ref().map(MediaTrack::id) != Some(id) {
                    return;
                }
                state.camera_watch.take();
                state.camera = None;
                tracing::warn!("Camera ended by source, falling back to placeholder");
                AudioPlan::Keep
            }
            Watched::Microphone => {
                if state.microphone.as_ref().map(MediaTrack::id) != Some(id) {
                    return;
                }
                state.microphone_watch.take();
                state.microphone = None;
                tracing::warn!("Microphone ended by source, dropping it from audio");
                AudioPlan::Rebuild
            }
            Watched::Screen => {
                if state.screen.as_ref().map(|s| s.video.id()) != Some(id) {
                    return;
                }
                state.screen_watch.take();
                if let Some(capture) = state.screen.take() {
                    capture.stop();
                }
                tracing::info!("Screen share ended by source, reverting composition");
                AudioPlan::Rebuild
            }
        };

        self.inner.recompute(&mut state, plan);
    }

    /// The current composition
    pub fn composition(&self) -> Option<Arc<Composition>> {
        self.inner.current.borrow().clone()
    }

    /// Watch composition changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Composition>>> {
        self.inner.current.subscribe()
    }

    /// The open camera track, whether or not it is in the composition
    pub async fn camera_track(&self) -> Option<MediaTrack> {
        self.inner.state.lock().await.camera.clone()
    }

    /// The open microphone track, whether or not it is in the composition
    pub async fn microphone_track(&self) -> Option<MediaTrack> {
        self.inner.state.lock().await.microphone.clone()
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.inner
            .state
            .lock()
            .await
            .screen
            .as_ref()
            .is_some_and(|s| s.video.is_live())
    }

    /// Stop every source and clear the composition. Safe to call twice.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return;
        }
        state.shut_down = true;

        for watch in [
            state.screen_watch.take(),
            state.camera_watch.take(),
            state.microphone_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            watch.abort();
        }
        if let Some(capture) = state.screen.take() {
            capture.stop();
        }
        for track in [
            state.camera.take(),
            state.microphone.take(),
            state.placeholder.take(),
        ]
        .into_iter()
        .flatten()
        {
            track.stop();
        }
        if let Some(mix) = state.mix.take() {
            mix.teardown();
        }

        self.inner.current.send_replace(None);
        tracing::info!("Composition engine shut down");
    }
}

impl EngineInner {
    /// Build and publish a new composition from the current state
    fn recompute(&self, state: &mut EngineState, audio_plan: AudioPlan) -> Arc<Composition> {
        let screen = state.screen.clone().filter(|s| s.video.is_live());
        let camera = state
            .camera
            .clone()
            .filter(|c| state.camera_on && c.is_live());

        let (primary, secondary) = match (&screen, camera) {
            (Some(screen), camera) => (screen.video.clone(), camera),
            (None, Some(camera)) => (camera, None),
            (None, None) => (self.placeholder(state), None),
        };

        // The placeholder is only kept alive while it is on screen
        if primary.source() != SourceKind::Placeholder {
            if let Some(placeholder) = state.placeholder.take() {
                placeholder.stop();
            }
        }

        let audio = match audio_plan {
            AudioPlan::Keep => self
                .current
                .borrow()
                .as_ref()
                .and_then(|c| c.audio().cloned())
                .filter(MediaTrack::is_live)
                .or_else(|| self.build_audio(state, screen.as_ref())),
            AudioPlan::Rebuild => self.build_audio(state, screen.as_ref()),
        };

        state.revision += 1;
        let composition = Arc::new(Composition::new(state.revision, primary, secondary, audio));

        tracing::debug!(
            revision = composition.revision(),
            primary = ?composition.primary().source(),
            secondary = composition.secondary().is_some(),
            audio = ?composition.audio().map(MediaTrack::source),
            "Composition rebuilt"
        );

        self.current.send_replace(Some(Arc::clone(&composition)));
        composition
    }

    fn placeholder(&self, state: &mut EngineState) -> MediaTrack {
        match &state.placeholder {
            Some(track) if track.is_live() => track.clone(),
            _ => {
                let track = self.sources.placeholder.create();
                state.placeholder = Some(track.clone());
                track
            }
        }
    }

    /// Build the audio path from scratch, tearing down the previous mix graph
    fn build_audio(
        &self,
        state: &mut EngineState,
        screen: Option<&DisplayCapture>,
    ) -> Option<MediaTrack> {
        let previous = state.mix.take();

        let microphone = state
            .microphone
            .clone()
            .filter(|m| state.microphone_on && m.is_live());

        let audio = match screen {
            None => microphone,
            Some(screen) => {
                let inputs: Vec<MediaTrack> = microphone
                    .into_iter()
                    .chain(screen.audio.clone().filter(MediaTrack::is_live))
                    .collect();

                if inputs.is_empty() {
                    None
                } else {
                    match self.sources.mixer.mix(&inputs) {
                        Ok(graph) => {
                            let output = graph.output().clone();
                            state.mix = Some(graph);
                            Some(output)
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, inputs = inputs.len(), "Audio mix failed, sending first input");
                            inputs.into_iter().next()
                        }
                    }
                }
            }
        };

        if let Some(previous) = previous {
            previous.teardown();
        }
        audio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::composition::SenderSlot;
    use crate::testing::FakeMedia;

    #[tokio::test]
    async fn test_preview_camera_only() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());

        let comp = engine.start_preview(None, None).await.unwrap();
        assert_eq!(comp.primary().source(), SourceKind::Camera);
        assert!(comp.secondary().is_none());
        assert_eq!(comp.audio().map(MediaTrack::source), Some(SourceKind::Microphone));
        assert_eq!(engine.composition().unwrap().revision(), comp.revision());
    }

    #[tokio::test]
    async fn test_camera_denied_falls_back_to_placeholder() {
        let media = FakeMedia::new();
        media.deny_camera(true);
        let engine = CompositionEngine::new(media.sources());

        let err = engine.start_preview(Some("cam0"), None).await.unwrap_err();
        assert!(matches!(err, Error::DeviceAcquisitionFailed { .. }));

        // Degraded composition is still published
        let comp = engine.composition().unwrap();
        assert_eq!(comp.primary().source(), SourceKind::Placeholder);
        assert_eq!(comp.audio().map(MediaTrack::source), Some(SourceKind::Microphone));
    }

    #[tokio::test]
    async fn test_camera_toggle_keeps_device_warm() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        engine.start_preview(None, None).await.unwrap();
        let camera = engine.camera_track().await.unwrap();

        let comp = engine.set_camera_enabled(false).await.unwrap();
        assert_eq!(comp.primary().source(), SourceKind::Placeholder);
        assert!(camera.is_live());

        let comp = engine.set_camera_enabled(true).await.unwrap();
        assert_eq!(comp.primary(), &camera);
        assert_eq!(media.cameras_opened(), 1);
    }

    #[tokio::test]
    async fn test_switch_camera_stops_only_old_video() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        let before = engine.start_preview(Some("cam0"), Some("mic0")).await.unwrap();
        let old_camera = before.primary().clone();
        let mic = engine.microphone_track().await.unwrap();

        let after = engine.switch_camera("cam1").await.unwrap();

        assert!(!old_camera.is_live());
        assert!(mic.is_live());
        assert_ne!(after.primary(), &old_camera);
        assert_eq!(after.primary().label(), "camera:cam1");
        assert_eq!(after.audio(), before.audio());
    }

    #[tokio::test]
    async fn test_switch_camera_failure_keeps_old() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        let before = engine.start_preview(Some("cam0"), None).await.unwrap();

        media.deny_camera(true);
        assert!(engine.switch_camera("cam1").await.is_err());

        let current = engine.composition().unwrap();
        assert_eq!(current.revision(), before.revision());
        assert!(before.primary().is_live());
    }

    #[tokio::test]
    async fn test_screen_share_adds_pip_and_mix() {
        let media = FakeMedia::new();
        media.screen_audio(true);
        let engine = CompositionEngine::new(media.sources());
        let preview = engine.start_preview(None, None).await.unwrap();

        let comp = engine.start_screen_share().await.unwrap();
        assert_eq!(comp.primary().source(), SourceKind::Screen);
        assert_eq!(comp.secondary(), Some(preview.primary()));
        assert_eq!(comp.audio().map(MediaTrack::source), Some(SourceKind::Mix));
        assert_eq!(media.last_mix_inputs(), 2);
    }

    #[tokio::test]
    async fn test_mix_rebuilt_fresh() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        engine.start_preview(None, None).await.unwrap();

        let first = engine.start_screen_share().await.unwrap();
        let first_mix = first.audio().unwrap().clone();

        let second = engine.set_microphone_enabled(false).await.unwrap();
        // Old graph torn down, new one built (screen has no audio here)
        assert!(!first_mix.is_live());
        assert!(second.audio().is_none());

        let third = engine.set_microphone_enabled(true).await.unwrap();
        let third_mix = third.audio().unwrap();
        assert_eq!(third_mix.source(), SourceKind::Mix);
        assert_ne!(third_mix, &first_mix);
        assert_eq!(media.mixes_built(), 2);
    }

    #[tokio::test]
    async fn test_screen_share_pip_only_when_camera_on() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        engine.start_preview(None, None).await.unwrap();
        engine.start_screen_share().await.unwrap();

        let comp = engine.set_camera_enabled(false).await.unwrap();
        assert_eq!(comp.primary().source(), SourceKind::Screen);
        assert!(comp.secondary().is_none());
        assert!(comp.track(SenderSlot::SecondaryVideo).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_screen_ended_by_source_reverts() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        let preview = engine.start_preview(None, None).await.unwrap();
        let shared = engine.start_screen_share().await.unwrap();

        let mut updates = engine.subscribe();
        updates.borrow_and_update();

        // The OS ends the share; nobody calls stop_screen_share
        shared.primary().stop();
        updates.changed().await.unwrap();

        let comp = engine.composition().unwrap();
        assert_eq!(comp.primary(), preview.primary());
        assert!(comp.secondary().is_none());
        assert_eq!(comp.audio().map(MediaTrack::source), Some(SourceKind::Microphone));
        assert!(!engine.is_screen_sharing().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_ended_falls_back_to_placeholder() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        let preview = engine.start_preview(None, None).await.unwrap();

        let mut updates = engine.subscribe();
        updates.borrow_and_update();

        // Unplugged: the track ends without any call into the engine
        preview.primary().stop();
        updates.changed().await.unwrap();

        let comp = engine.composition().unwrap();
        assert_eq!(comp.revision(), preview.revision() + 1);
        assert_eq!(comp.primary().source(), SourceKind::Placeholder);
        assert_eq!(comp.audio(), preview.audio());
        assert!(engine.camera_track().await.is_none());

        // Turning the camera on again reopens the device
        let comp = engine.set_camera_enabled(true).await.unwrap();
        assert_eq!(comp.primary().source(), SourceKind::Camera);
        assert!(comp.primary().is_live());
        assert_eq!(media.cameras_opened(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_microphone_ended_drops_audio() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        let preview = engine.start_preview(None, None).await.unwrap();

        let mut updates = engine.subscribe();
        updates.borrow_and_update();

        preview.audio().unwrap().stop();
        updates.changed().await.unwrap();

        let comp = engine.composition().unwrap();
        assert!(comp.audio().is_none());
        assert_eq!(comp.primary(), preview.primary());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switched_out_camera_is_not_watched() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        engine.start_preview(Some("cam0"), None).await.unwrap();

        let switched = engine.switch_camera("cam1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let current = engine.composition().unwrap();
        assert_eq!(current.revision(), switched.revision());
        assert_eq!(current.primary().label(), "camera:cam1");
    }

    #[tokio::test]
    async fn test_toggles_rejected_after_shutdown() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        engine.start_preview(None, None).await.unwrap();
        engine.shutdown().await;

        assert!(matches!(engine.set_camera_enabled(true).await, Err(Error::ShutDown)));
        assert!(matches!(engine.set_microphone_enabled(true).await, Err(Error::ShutDown)));
        assert!(matches!(engine.start_screen_share().await, Err(Error::ShutDown)));
        assert!(matches!(engine.switch_camera("cam1").await, Err(Error::ShutDown)));

        assert_eq!(media.cameras_opened(), 1);
        assert_eq!(media.microphones_opened(), 1);
        assert!(engine.composition().is_none());

        // A new preview starts the sources again
        engine.start_preview(None, None).await.unwrap();
        assert!(engine.set_camera_enabled(false).await.is_ok());
    }

    #[tokio::test]
    async fn test_placeholder_stopped_when_unused() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        engine.start_preview(None, None).await.unwrap();

        let off = engine.set_camera_enabled(false).await.unwrap();
        let placeholder = off.primary().clone();
        assert_eq!(placeholder.source(), SourceKind::Placeholder);

        engine.set_camera_enabled(true).await.unwrap();
        assert!(!placeholder.is_live());
    }

    #[tokio::test]
    async fn test_shutdown_idempotent() {
        let media = FakeMedia::new();
        let engine = CompositionEngine::new(media.sources());
        let comp = engine.start_preview(None, None).await.unwrap();

        engine.shutdown().await;
        engine.shutdown().await;

        assert!(engine.composition().is_none());
        assert!(!comp.primary().is_live());
        assert!(!comp.audio().unwrap().is_live());
    }
}
