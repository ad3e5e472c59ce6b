//! Live broadcaster
//!
//! High-level API tying the signaling channel, the session registry and the
//! composition engine together for one producer.
//!
//! Inbound work for a viewer (joins, answers, candidates, transport events,
//! leaves) is queued on that viewer's own lane and applied in arrival order
//! by a task per lane, so a viewer stuck in a slow negotiation only delays
//! itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{Error, Result};
use crate::ids::ViewerId;
use crate::media::{Composition, CompositionEngine, MediaSources};
use crate::registry::{RegistryEvents, SessionRegistry};
use crate::renegotiate::RenegotiationCoordinator;
use crate::session::{PeerEvent, PeerFactory, SessionState};
use crate::signaling::{
    ChannelEvent, ChannelState, Connector, IceCandidate, SessionDescription, SignalingChannel,
    SignalingMessage,
};
use crate::stats::{BroadcastStats, SessionInfo};

use super::config::BroadcasterConfig;
use super::observer::StreamObserver;

/// External collaborators of a [`Broadcaster`]
pub struct Collaborators {
    /// Capture, display capture, mixer and placeholder
    pub media: MediaSources,
    /// Opens signaling links
    pub connector: Arc<dyn Connector>,
    /// Allocates media transports
    pub peers: Arc<dyn PeerFactory>,
    /// Optional observer for surrounding layers
    pub observer: Option<Arc<dyn StreamObserver>>,
}

struct Live {
    title: Option<String>,
}

struct Shared {
    config: BroadcasterConfig,
    engine: CompositionEngine,
    channel: SignalingChannel,
    registry: Arc<SessionRegistry>,
    observer: Option<Arc<dyn StreamObserver>>,
    /// Some while broadcasting
    live: Mutex<Option<Live>>,
}

#[derive(Default)]
struct Tasks {
    events: Option<JoinHandle<()>>,
    coordinator: Option<RenegotiationCoordinator>,
}

/// One producer broadcasting to many viewers
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use castline::broadcaster::{Broadcaster, BroadcasterConfig, Collaborators};
/// use castline::signaling::TcpConnector;
/// use castline::testing::{FakeMedia, FakePeerFactory};
///
/// # async fn example() -> castline::error::Result<()> {
/// let config = BroadcasterConfig::new("studio-1").endpoint("127.0.0.1:9000");
/// let broadcaster = Broadcaster::new(
///     config,
///     Collaborators {
///         media: FakeMedia::new().sources(),
///         connector: Arc::new(TcpConnector::default()),
///         peers: Arc::new(FakePeerFactory::new()),
///         observer: None,
///     },
/// );
///
/// broadcaster.start_preview().await?;
/// broadcaster.connect().await?;
/// broadcaster.start_broadcast(Some("Live now".into())).await?;
/// # Ok(())
/// # }
/// ```
pub struct Broadcaster {
    shared: Arc<Shared>,
    tasks: Mutex<Tasks>,
    shut_down: AtomicBool,
}

impl Broadcaster {
    /// Create a broadcaster.
    ///
    /// Must be called inside a tokio runtime; the event task is spawned here.
    pub fn new(config: BroadcasterConfig, collaborators: Collaborators) -> Self {
        let (channel, channel_events) =
            SignalingChannel::new(config.channel.clone(), collaborators.connector);
        let (registry, registry_events) = SessionRegistry::new(
            config.registry.clone(),
            config.broadcaster_id.clone(),
            channel.clone(),
            collaborators.peers,
        );
        let engine = CompositionEngine::new(collaborators.media);
        let compositions = engine.subscribe();

        let shared = Arc::new(Shared {
            config,
            engine,
            channel,
            registry,
            observer: collaborators.observer,
            live: Mutex::new(None),
        });

        let events = tokio::spawn(run_events(
            Arc::clone(&shared),
            channel_events,
            registry_events,
            compositions,
        ));

        Self {
            shared,
            tasks: Mutex::new(Tasks {
                events: Some(events),
                coordinator: None,
            }),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Open the configured camera and microphone and build the first
    /// composition.
    ///
    /// A denied device is reported, but the degraded composition (placeholder
    /// video, no audio) is still current afterwards.
    pub async fn start_preview(&self) -> Result<Arc<Composition>> {
        let config = &self.shared.config;
        self.shared
            .engine
            .start_preview(
                config.camera_device.as_deref(),
                config.microphone_device.as_deref(),
            )
            .await
    }

    /// Connect to signaling.
    ///
    /// The join announcement is sent on this and every later reconnect.
    pub async fn connect(&self) -> Result<()> {
        let config = &self.shared.config;
        self.shared
            .channel
            .set_announce(Some(SignalingMessage::BroadcasterJoin {
                broadcaster_id: config.broadcaster_id.clone(),
                user_info: config.user_info.clone(),
            }));
        self.shared.channel.connect(config.endpoints.clone()).await
    }

    /// Go live and ask the server for the current viewers.
    ///
    /// Requires a composition (call [`start_preview`](Self::start_preview)
    /// first). Calling it while live does nothing.
    pub async fn start_broadcast(&self, title: Option<String>) -> Result<()> {
        let composition = self.shared.engine.composition().ok_or(Error::NoComposition)?;

        {
            let mut live = self.shared.live.lock();
            if live.is_some() {
                return Ok(());
            }
            *live = Some(Live {
                title: title.clone(),
            });
        }

        self.shared.registry.set_composition(composition);
        let coordinator = RenegotiationCoordinator::spawn(
            Arc::clone(&self.shared.registry),
            self.shared.engine.subscribe(),
        );
        self.tasks.lock().coordinator = Some(coordinator);

        self.shared.channel.send(SignalingMessage::StreamStart {
            broadcaster_id: self.shared.config.broadcaster_id.clone(),
            title,
            request_viewers: true,
        });

        tracing::info!(broadcaster = %self.shared.config.broadcaster_id, "Broadcast started");
        Ok(())
    }

    /// End the broadcast: stop renegotiation, close every session, drop
    /// their queued signaling. Safe to call more than once.
    pub async fn stop_broadcast(&self) {
        if self.shared.live.lock().take().is_none() {
            return;
        }

        let coordinator = self.tasks.lock().coordinator.take();
        if let Some(coordinator) = coordinator {
            coordinator.stop();
        }
        self.shared.registry.close_all().await;

        self.shared.channel.send(SignalingMessage::StreamEnd {
            broadcaster_id: self.shared.config.broadcaster_id.clone(),
        });

        tracing::info!(broadcaster = %self.shared.config.broadcaster_id, "Broadcast stopped");
    }

    /// Stop everything: broadcast, sources, signaling and the event task.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        self.stop_broadcast().await;
        self.shared.registry.close_all().await;
        self.shared.engine.shutdown().await;
        self.shared.channel.close();

        let events = self.tasks.lock().events.take();
        if let Some(events) = events {
            events.abort();
        }

        tracing::info!(broadcaster = %self.shared.config.broadcaster_id, "Broadcaster shut down");
    }

    /// Toggle the camera; the device stays open while off
    pub async fn set_camera_enabled(&self, enabled: bool) -> Result<Arc<Composition>> {
        self.shared.engine.set_camera_enabled(enabled).await
    }

    /// Switch camera device
    pub async fn switch_camera(&self, device_id: &str) -> Result<Arc<Composition>> {
        self.shared.engine.switch_camera(device_id).await
    }

    /// Toggle the microphone; the device stays open while off
    pub async fn set_microphone_enabled(&self, enabled: bool) -> Result<Arc<Composition>> {
        self.shared.engine.set_microphone_enabled(enabled).await
    }

    /// Switch microphone device
    pub async fn switch_microphone(&self, device_id: &str) -> Result<Arc<Composition>> {
        self.shared.engine.switch_microphone(device_id).await
    }

    /// Start sharing the screen
    pub async fn start_screen_share(&self) -> Result<Arc<Composition>> {
        self.shared.engine.start_screen_share().await
    }

    /// Stop sharing the screen
    pub async fn stop_screen_share(&self) -> Result<Arc<Composition>> {
        self.shared.engine.stop_screen_share().await
    }

    /// The current composition
    pub fn composition(&self) -> Option<Arc<Composition>> {
        self.shared.engine.composition()
    }

    pub fn is_broadcasting(&self) -> bool {
        self.shared.live.lock().is_some()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.shared.channel.state()
    }

    pub async fn session_state(&self, viewer: &ViewerId) -> Option<SessionState> {
        self.shared.registry.state(viewer).await
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.registry.snapshot().await
    }

    /// Channel counters plus a snapshot of every session
    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            channel: self.shared.channel.stats(),
            sessions: self.shared.registry.snapshot().await,
        }
    }

    pub fn engine(&self) -> &CompositionEngine {
        &self.shared.engine
    }

    pub fn channel(&self) -> &SignalingChannel {
        &self.shared.channel
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.shared.registry
    }
}

impl Drop for Broadcaster {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(events) = tasks.events.take() {
            events.abort();
        }
        tasks.coordinator.take();
    }
}

impl Shared {
    fn is_live(&self) -> bool {
        self.live.lock().is_some()
    }

    fn on_channel_state(&self, state: ChannelState, connected_before: &mut bool) {
        if let Some(observer) = &self.observer {
            observer.on_channel_state(&state);
        }

        match state {
            ChannelState::Connected { endpoint } => {
                if *connected_before {
                    let title = self.live.lock().as_ref().map(|live| live.title.clone());
                    if let Some(title) = title {
                        tracing::info!(endpoint = %endpoint, "Reconnected while live, requesting viewers");
                        self.channel.send(SignalingMessage::StreamStart {
                            broadcaster_id: self.config.broadcaster_id.clone(),
                            title,
                            request_viewers: true,
                        });
                    }
                }
                *connected_before = true;
            }
            ChannelState::Unavailable => {
                tracing::warn!("Signaling unavailable, waiting for an explicit connect");
                if let Some(observer) = &self.observer {
                    observer.on_transport_unavailable();
                }
            }
            _ => {}
        }
    }

    fn on_message(&self, message: SignalingMessage, lanes: &mut ViewerLanes) {
        match message {
            SignalingMessage::ViewerJoin { viewer_id } => self.connect_viewers(vec![viewer_id], false, lanes),
            SignalingMessage::OnlineViewers { viewers } => self.connect_viewers(viewers, false, lanes),
            SignalingMessage::ViewersNeedConnection { viewers } => {
                self.connect_viewers(viewers, true, lanes)
            }
            SignalingMessage::Answer {
                viewer_id, answer, ..
            } => lanes.dispatch(viewer_id, ViewerWork::Answer(answer)),
            SignalingMessage::IceCandidate {
                viewer_id,
                candidate,
                ..
            } => lanes.dispatch(viewer_id, ViewerWork::Candidate(candidate)),
            SignalingMessage::ViewerLeave { viewer_id } => {
                lanes.dispatch(viewer_id, ViewerWork::Leave)
            }
            other => {
                tracing::trace!(kind = other.kind(), "Ignoring message");
            }
        }
    }

    /// Ensure a session for each viewer, rebuilding failed ones if asked
    fn connect_viewers(&self, viewers: Vec<ViewerId>, rebuild_failed: bool, lanes: &mut ViewerLanes) {
        if !self.is_live() {
            tracing::debug!(viewers = viewers.len(), "Not broadcasting, ignoring viewers");
            return;
        }

        for viewer in viewers {
            lanes.dispatch(viewer, ViewerWork::Connect { rebuild_failed });
        }
    }
}

/// Inbound work for one viewer
#[derive(Debug)]
enum ViewerWork {
    Connect { rebuild_failed: bool },
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Peer(PeerEvent),
    Leave,
}

/// One ordered work queue per viewer, each drained by its own task
struct ViewerLanes {
    registry: Arc<SessionRegistry>,
    lanes: HashMap<ViewerId, mpsc::UnboundedSender<ViewerWork>>,
    tasks: JoinSet<()>,
}

impl ViewerLanes {
    fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            lanes: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Queue `work` behind everything already queued for `viewer`
    fn dispatch(&mut self, viewer: ViewerId, work: ViewerWork) {
        let leaving = matches!(work, ViewerWork::Leave);

        let unsent = match self.lanes.get(&viewer) {
            Some(lane) => lane.send(work).err().map(|e| e.0),
            None => Some(work),
        };
        if let Some(work) = unsent {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(work);
            self.tasks
                .spawn(run_lane(Arc::clone(&self.registry), viewer.clone(), rx));
            self.lanes.insert(viewer.clone(), tx);
        }

        // The lane task drains what is queued and exits
        if leaving {
            self.lanes.remove(&viewer);
        }
    }
}

async fn run_lane(
    registry: Arc<SessionRegistry>,
    viewer: ViewerId,
    mut work: mpsc::UnboundedReceiver<ViewerWork>,
) {
    while let Some(item) = work.recv().await {
        match item {
            ViewerWork::Connect { rebuild_failed } => {
                let result = if rebuild_failed
                    && registry.state(&viewer).await == Some(SessionState::Failed)
                {
                    registry.rebuild(&viewer).await
                } else {
                    registry.ensure(&viewer).await.map(|_| ())
                };
                if let Err(e) = result {
                    tracing::warn!(viewer = %viewer, error = %e, "Could not connect viewer");
                }
            }
            ViewerWork::Answer(answer) => {
                if let Err(e) = registry.handle_answer(&viewer, answer).await {
                    tracing::debug!(viewer = %viewer, error = %e, "Answer not applied");
                }
            }
            ViewerWork::Candidate(candidate) => {
                if let Err(e) = registry.handle_remote_candidate(&viewer, candidate).await {
                    tracing::debug!(viewer = %viewer, error = %e, "Candidate not applied");
                }
            }
            ViewerWork::Peer(event) => registry.handle_peer_event(event).await,
            ViewerWork::Leave => {
                if registry.remove(&viewer).await {
                    tracing::info!(viewer = %viewer, "Viewer left");
                }
            }
        }
    }
}

async fn run_events(
    shared: Arc<Shared>,
    mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    mut registry_events: RegistryEvents,
    mut compositions: watch::Receiver<Option<Arc<Composition>>>,
) {
    let mut lanes = ViewerLanes::new(Arc::clone(&shared.registry));
    let mut connected_before = false;

    loop {
        tokio::select! {
            Some(event) = channel_events.recv() => match event {
                ChannelEvent::StateChanged(state) => {
                    shared.on_channel_state(state, &mut connected_before);
                }
                ChannelEvent::Message(message) => {
                    shared.on_message(message, &mut lanes);
                }
            },
            Some(event) = registry_events.peer.recv() => {
                lanes.dispatch(event.viewer.clone(), ViewerWork::Peer(event));
            }
            Some(event) = registry_events.sessions.recv() => {
                if let Some(observer) = &shared.observer {
                    observer.on_session_state(&event.viewer, event.state);
                }
            }
            Ok(()) = compositions.changed() => {
                let composition = compositions.borrow_and_update().clone();
                if let (Some(observer), Some(composition)) = (&shared.observer, composition) {
                    observer.on_composition(&composition);
                }
            }
            Some(done) = lanes.tasks.join_next() => {
                if let Err(e) = done {
                    tracing::warn!(error = %e, "Viewer lane aborted");
                }
            }
            else => break,
        }
    }
}
