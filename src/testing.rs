//! In-memory collaborators
//!
//! Stand-ins for everything the crate talks to: a signaling connector with
//! scriptable endpoints, capture devices, a mixer, a placeholder renderer and
//! media transports. Used by the test suites and the loopback demo.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::ids::ViewerId;
use crate::media::{
    AudioMixer, CaptureProvider, DisplayCapture, DisplayCaptureProvider, MediaSources,
    MediaTrack, MixGraph, PlaceholderSource, SenderSlot, SourceKind, TrackId,
};
use crate::session::{PeerConnectionState, PeerEventSink, PeerFactory, PeerTransport};
use crate::signaling::{Connector, IceCandidate, Link, SessionDescription, SignalingMessage};

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ConnectorState {
    listeners: HashMap<String, mpsc::UnboundedSender<Link>>,
    unreachable: HashSet<String>,
    hanging: HashSet<String>,
    attempts: HashMap<String, usize>,
}

/// In-process signaling connector
///
/// An endpoint accepts connections only while something [`listen`]s on it
/// and it has not been made unreachable. A hanging endpoint never answers.
///
/// [`listen`]: MemoryConnector::listen
#[derive(Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections on `endpoint`
    pub fn listen(&self, endpoint: &str) -> MemoryServer {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().listeners.insert(endpoint.to_string(), tx);
        MemoryServer { accepted: rx }
    }

    /// Make `endpoint` refuse (false) or accept (true) connections
    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        let mut state = self.state.lock();
        if reachable {
            state.unreachable.remove(endpoint);
        } else {
            state.unreachable.insert(endpoint.to_string());
        }
    }

    /// Make connection attempts to `endpoint` never complete
    pub fn set_hanging(&self, endpoint: &str, hanging: bool) {
        let mut state = self.state.lock();
        if hanging {
            state.hanging.insert(endpoint.to_string());
        } else {
            state.hanging.remove(endpoint);
        }
    }

    /// Connection attempts made to `endpoint`
    pub fn attempts(&self, endpoint: &str) -> usize {
        self.state.lock().attempts.get(endpoint).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link> {
        let hanging = {
            let mut state = self.state.lock();
            *state.attempts.entry(endpoint.to_string()).or_default() += 1;
            if state.unreachable.contains(endpoint) {
                return Err(refused(endpoint));
            }
            state.hanging.contains(endpoint)
        };

        if hanging {
            std::future::pending::<()>().await;
        }

        let (client, server) = Link::pair();
        let state = self.state.lock();
        match state.listeners.get(endpoint) {
            Some(listener) if listener.send(server).is_ok() => Ok(client),
            _ => Err(refused(endpoint)),
        }
    }
}

fn refused(endpoint: &str) -> Error {
    Error::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("{} refused", endpoint),
    ))
}

/// Server side of a [`MemoryConnector`] endpoint
pub struct MemoryServer {
    accepted: mpsc::UnboundedReceiver<Link>,
}

impl MemoryServer {
    /// Wait for the next client connection
    pub async fn accept(&mut self) -> Option<ServerLink> {
        self.accepted.recv().await.map(ServerLink::new)
    }

    /// Take a connection that has already arrived
    pub fn try_accept(&mut self) -> Option<ServerLink> {
        self.accepted.try_recv().ok().map(ServerLink::new)
    }
}

/// One accepted connection, seen from the server. Dropping it closes the link.
pub struct ServerLink {
    link: Link,
}

impl ServerLink {
    fn new(link: Link) -> Self {
        Self { link }
    }

    /// Next message from the client; `None` once the client is gone
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            let text = self.link.inbound.recv().await?;
            match SignalingMessage::from_json(&text) {
                Ok(message) => return Some(message),
                Err(e) => tracing::warn!(error = %e, "Undecodable message from client"),
            }
        }
    }

    /// A message that has already arrived
    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        while let Ok(text) = self.link.inbound.try_recv() {
            if let Ok(message) = SignalingMessage::from_json(&text) {
                return Some(message);
            }
        }
        None
    }

    /// Every message that has already arrived
    pub fn drain(&mut self) -> Vec<SignalingMessage> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Send a message to the client. Returns false if the client is gone.
    pub fn send(&self, message: &SignalingMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.link.outbound.send(text).is_ok(),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MediaState {
    deny_camera: bool,
    deny_microphone: bool,
    deny_display: bool,
    fail_mix: bool,
    screen_audio: bool,
    cameras_opened: usize,
    microphones_opened: usize,
    placeholders_created: usize,
    mixes_built: usize,
    mix_teardowns: usize,
    last_mix_inputs: usize,
    last_display: Option<DisplayCapture>,
}

/// Fake capture devices, display capture, mixer and placeholder
#[derive(Clone, Default)]
pub struct FakeMedia {
    state: Arc<Mutex<MediaState>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collaborator set for a [`CompositionEngine`](crate::media::CompositionEngine)
    pub fn sources(&self) -> MediaSources {
        MediaSources {
            capture: Arc::new(self.clone()),
            display: Arc::new(self.clone()),
            mixer: Arc::new(self.clone()),
            placeholder: Arc::new(self.clone()),
        }
    }

    /// Refuse camera access
    pub fn deny_camera(&self, deny: bool) {
        self.state.lock().deny_camera = deny;
    }

    /// Refuse microphone access
    pub fn deny_microphone(&self, deny: bool) {
        self.state.lock().deny_microphone = deny;
    }

    /// Refuse screen capture
    pub fn deny_display(&self, deny: bool) {
        self.state.lock().deny_display = deny;
    }

    /// Make the mixer fail
    pub fn fail_mix(&self, fail: bool) {
        self.state.lock().fail_mix = fail;
    }

    /// Include system audio in screen captures
    pub fn screen_audio(&self, enabled: bool) {
        self.state.lock().screen_audio = enabled;
    }

    /// End the most recent screen capture from the source side
    pub fn end_screen_share(&self) -> bool {
        match &self.state.lock().last_display {
            Some(capture) => capture.video.stop(),
            None => false,
        }
    }

    pub fn cameras_opened(&self) -> usize {
        self.state.lock().cameras_opened
    }

    pub fn microphones_opened(&self) -> usize {
        self.state.lock().microphones_opened
    }

    pub fn placeholders_created(&self) -> usize {
        self.state.lock().placeholders_created
    }

    pub fn mixes_built(&self) -> usize {
        self.state.lock().mixes_built
    }

    pub fn mix_teardowns(&self) -> usize {
        self.state.lock().mix_teardowns
    }

    /// Input count of the most recent mix
    pub fn last_mix_inputs(&self) -> usize {
        self.state.lock().last_mix_inputs
    }
}

#[async_trait]
impl CaptureProvider for FakeMedia {
    async fn open_camera(&self, device_id: Option<&str>) -> Result<MediaTrack> {
        let device = device_id.unwrap_or("default");
        let mut state = self.state.lock();
        if state.deny_camera {
            return Err(Error::device(device, "permission denied"));
        }
        state.cameras_opened += 1;
        Ok(MediaTrack::new(SourceKind::Camera, format!("camera:{}", device)))
    }

    async fn open_microphone(&self, device_id: Option<&str>) -> Result<MediaTrack> {
        let device = device_id.unwrap_or("default");
        let mut state = self.state.lock();
        if state.deny_microphone {
            return Err(Error::device(device, "permission denied"));
        }
        state.microphones_opened += 1;
        Ok(MediaTrack::new(
            SourceKind::Microphone,
            format!("microphone:{}", device),
        ))
    }
}

#[async_trait]
impl DisplayCaptureProvider for FakeMedia {
    async fn open_display(&self) -> Result<DisplayCapture> {
        let mut state = self.state.lock();
        if state.deny_display {
            return Err(Error::device("display", "permission denied"));
        }

        let capture = DisplayCapture {
            video: MediaTrack::new(SourceKind::Screen, "screen"),
            audio: state
                .screen_audio
                .then(|| MediaTrack::new(SourceKind::ScreenAudio, "screen-audio")),
        };
        state.last_display = Some(capture.clone());
        Ok(capture)
    }
}

impl AudioMixer for FakeMedia {
    fn mix(&self, inputs: &[MediaTrack]) -> Result<MixGraph> {
        let mut state = self.state.lock();
        if state.fail_mix {
            return Err(Error::Peer("mixer unavailable".into()));
        }
        state.mixes_built += 1;
        state.last_mix_inputs = inputs.len();

        let counter = Arc::clone(&self.state);
        Ok(MixGraph::new(
            MediaTrack::new(SourceKind::Mix, format!("mix#{}", state.mixes_built)),
            move || counter.lock().mix_teardowns += 1,
        ))
    }
}

impl PlaceholderSource for FakeMedia {
    fn create(&self) -> MediaTrack {
        self.state.lock().placeholders_created += 1;
        MediaTrack::new(SourceKind::Placeholder, "placeholder")
    }
}

// ---------------------------------------------------------------------------
// Transports
// ---------------------------------------------------------------------------

/// A sender mutation recorded by [`FakePeer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderOp {
    Add(SenderSlot),
    Replace(SenderSlot),
    Remove(SenderSlot),
}

#[derive(Default)]
struct PeerState {
    senders: BTreeMap<SenderSlot, TrackId>,
    ops: Vec<SenderOp>,
    offers: u64,
    answers: u64,
    remote: Vec<IceCandidate>,
    connected: bool,
    closed: bool,
    fail_offers: bool,
    offer_delay: Option<Duration>,
}

/// Recording media transport
#[derive(Default)]
pub struct FakePeer {
    sink: Option<PeerEventSink>,
    auto_connect: bool,
    state: Mutex<PeerState>,
}

impl FakePeer {
    /// A transport that reports no events
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that reports events to `sink`
    pub fn with_sink(sink: PeerEventSink) -> Self {
        Self {
            sink: Some(sink),
            ..Self::default()
        }
    }

    /// Report `Connected` as soon as the first answer is applied
    pub fn auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    pub fn generation(&self) -> u64 {
        self.sink.as_ref().map_or(0, PeerEventSink::generation)
    }

    /// Current senders in wire order
    pub fn senders(&self) -> Vec<(SenderSlot, TrackId)> {
        self.state
            .lock()
            .senders
            .iter()
            .map(|(slot, id)| (*slot, *id))
            .collect()
    }

    /// Every sender mutation so far
    pub fn sender_ops(&self) -> Vec<SenderOp> {
        self.state.lock().ops.clone()
    }

    pub fn offers_created(&self) -> u64 {
        self.state.lock().offers
    }

    pub fn answers_applied(&self) -> u64 {
        self.state.lock().answers
    }

    /// Candidates applied from the viewer, in order
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Make offer creation fail
    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    /// Make offer creation take `delay`
    pub fn delay_offers(&self, delay: Duration) {
        self.state.lock().offer_delay = Some(delay);
    }

    /// Report a connectivity change
    pub fn emit_state(&self, state: PeerConnectionState) {
        if let Some(sink) = &self.sink {
            sink.connection_state(state);
        }
    }

    /// Report a gathered local candidate
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        if let Some(sink) = &self.sink {
            sink.local_candidate(candidate);
        }
    }

    fn check_open(state: &PeerState) -> Result<()> {
        if state.closed {
            return Err(Error::Peer("transport closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    async fn add_sender(&self, slot: SenderSlot, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.senders.contains_key(&slot) {
            return Err(Error::Peer(format!("sender for {:?} exists", slot)));
        }
        state.senders.insert(slot, track.id());
        state.ops.push(SenderOp::Add(slot));
        Ok(())
    }

    async fn replace_track(&self, slot: SenderSlot, track: &MediaTrack) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        match state.senders.get_mut(&slot) {
            Some(current) => *current = track.id(),
            None => return Err(Error::Peer(format!("no sender for {:?}", slot))),
        }
        state.ops.push(SenderOp::Replace(slot));
        Ok(())
    }

    async fn remove_sender(&self, slot: SenderSlot) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.senders.remove(&slot).is_none() {
            return Err(Error::Peer(format!("no sender for {:?}", slot)));
        }
        state.ops.push(SenderOp::Remove(slot));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let delay = self.state.lock().offer_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        Self::check_open(&state)?;
        if state.fail_offers {
            return Err(Error::Peer("offer rejected".into()));
        }
        state.offers += 1;
        Ok(SessionDescription::offer(format!(
            "offer g{} n{} senders={}",
            self.generation(),
            state.offers,
            state.senders.len()
        )))
    }

    async fn apply_answer(&self, _answer: SessionDescription) -> Result<()> {
        let connect = {
            let mut state = self.state.lock();
            Self::check_open(&state)?;
            state.answers += 1;
            let connect = self.auto_connect && !state.connected;
            state.connected |= connect;
            connect
        };
        if connect {
            self.emit_state(PeerConnectionState::Connected);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        Self::check_open(&state)?;
        state.remote.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

/// Creates [`FakePeer`]s and keeps every one it created
#[derive(Default)]
pub struct FakePeerFactory {
    peers: Mutex<HashMap<ViewerId, Vec<Arc<FakePeer>>>>,
    fail_creates: Mutex<bool>,
    auto_connect: bool,
}

impl FakePeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Created transports report `Connected` once answered
    pub fn auto_connect() -> Self {
        Self {
            auto_connect: true,
            ..Self::default()
        }
    }

    /// Make allocation fail
    pub fn fail_creates(&self, fail: bool) {
        *self.fail_creates.lock() = fail;
    }

    /// Transports created so far, across all viewers
    pub fn created(&self) -> usize {
        self.peers.lock().values().map(Vec::len).sum()
    }

    /// The most recent transport for `viewer`
    pub fn peer(&self, viewer: &ViewerId) -> Option<Arc<FakePeer>> {
        self.peers.lock().get(viewer).and_then(|p| p.last().cloned())
    }

    /// Every transport created for `viewer`, oldest first
    pub fn peers(&self, viewer: &ViewerId) -> Vec<Arc<FakePeer>> {
        self.peers.lock().get(viewer).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerTransport>> {
        if *self.fail_creates.lock() {
            return Err(Error::Peer("transport allocation failed".into()));
        }

        let viewer = events.viewer().clone();
        let peer = Arc::new(FakePeer::with_sink(events).auto_connect(self.auto_connect));
        self.peers
            .lock()
            .entry(viewer)
            .or_default()
            .push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_connector_round_trip() {
        let connector = MemoryConnector::new();
        let mut server = connector.listen("sig");

        let mut client = connector.connect("sig").await.unwrap();
        let mut link = server.accept().await.unwrap();

        let msg = SignalingMessage::ViewerJoin {
            viewer_id: ViewerId::new("v1"),
        };
        assert!(link.send(&msg));
        let text = client.inbound.recv().await.unwrap();
        assert_eq!(SignalingMessage::from_json(&text).unwrap(), msg);

        client.outbound.send(msg.to_json().unwrap()).unwrap();
        assert_eq!(link.recv().await.unwrap(), msg);
        assert_eq!(connector.attempts("sig"), 1);
    }

    #[tokio::test]
    async fn test_unlistened_endpoint_refuses() {
        let connector = MemoryConnector::new();
        assert!(connector.connect("nowhere").await.is_err());

        let _server = connector.listen("sig");
        connector.set_reachable("sig", false);
        assert!(connector.connect("sig").await.is_err());
        assert_eq!(connector.attempts("sig"), 1);
    }

    #[tokio::test]
    async fn test_fake_peer_rejects_after_close() {
        let peer = FakePeer::new();
        let track = MediaTrack::new(SourceKind::Camera, "cam");

        peer.add_sender(SenderSlot::PrimaryVideo, &track).await.unwrap();
        assert!(peer.add_sender(SenderSlot::PrimaryVideo, &track).await.is_err());

        peer.close().await;
        assert!(peer.is_closed());
        assert!(peer.create_offer().await.is_err());
    }
}
