//! Session registry implementation
//!
//! The registry owns every viewer session. All state changes go through it,
//! so the transition table is enforced in one place and no session can be
//! mutated behind the registry's back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{Error, Result};
use crate::ids::{BroadcasterId, ViewerId};
use crate::media::Composition;
use crate::session::{
    ConsumerSession, PeerConnectionState, PeerEvent, PeerEventKind, PeerEventSink, PeerFactory,
    SessionState,
};
use crate::signaling::{IceCandidate, SessionDescription, SignalingChannel, SignalingMessage};
use crate::stats::SessionInfo;
use crate::task::backoff;

use super::config::RegistryConfig;
use super::error::RegistryError;

type SessionRef = Arc<Mutex<ConsumerSession>>;

/// A session changed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub viewer: ViewerId,
    pub state: SessionState,
}

/// Event streams produced by the registry
#[derive(Debug)]
pub struct RegistryEvents {
    /// Events reported by transports; feed back into
    /// [`SessionRegistry::handle_peer_event`]
    pub peer: mpsc::UnboundedReceiver<PeerEvent>,
    /// Session state changes
    pub sessions: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Registry of all viewer sessions
pub struct SessionRegistry {
    /// Configuration
    config: RegistryConfig,

    /// Producer id stamped on outgoing messages
    broadcaster_id: BroadcasterId,

    /// Offers and local candidates go out here
    channel: SignalingChannel,

    /// Allocates transports
    factory: Arc<dyn PeerFactory>,

    /// Map of viewer id to session
    ///
    /// Lock order: a session lock may be held while taking this lock, never
    /// the other way round.
    sessions: RwLock<HashMap<ViewerId, SessionRef>>,

    /// Latest composition; sessions always sync to this one
    composition: parking_lot::RwLock<Option<Arc<Composition>>>,

    /// Transport generation counter, shared by all viewers
    next_generation: AtomicU64,

    peer_events: mpsc::UnboundedSender<PeerEvent>,
    session_events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionRegistry {
    /// Create a registry
    pub fn new(
        config: RegistryConfig,
        broadcaster_id: BroadcasterId,
        channel: SignalingChannel,
        factory: Arc<dyn PeerFactory>,
    ) -> (Arc<Self>, RegistryEvents) {
        let (peer_events, peer_rx) = mpsc::unbounded_channel();
        let (session_events, session_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            config,
            broadcaster_id,
            channel,
            factory,
            sessions: RwLock::new(HashMap::new()),
            composition: parking_lot::RwLock::new(None),
            next_generation: AtomicU64::new(1),
            peer_events,
            session_events,
        });

        (
            registry,
            RegistryEvents {
                peer: peer_rx,
                sessions: session_rx,
            },
        )
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Latest composition known to the registry
    pub fn composition(&self) -> Option<Arc<Composition>> {
        self.composition.read().clone()
    }

    /// Store `composition` if it is newer than the current one
    pub fn set_composition(&self, composition: Arc<Composition>) -> bool {
        let mut current = self.composition.write();
        if current
            .as_ref()
            .is_some_and(|c| c.revision() >= composition.revision())
        {
            return false;
        }
        *current = Some(composition);
        true
    }

    /// Make sure `viewer` has a live session.
    ///
    /// No-op (returns false) if a session already exists. Otherwise a
    /// session is created and, if a composition is known, negotiation starts.
    /// The transport is allocated without holding the session map.
    pub async fn ensure(self: &Arc<Self>, viewer: &ViewerId) -> Result<bool> {
        if self.get(viewer).await.is_some() {
            return Ok(false);
        }

        let generation = self.next_generation();
        let peer = self
            .factory
            .create(self.sink(viewer, generation))
            .await
            .map_err(|e| {
                tracing::warn!(viewer = %viewer, error = %e, "Failed to allocate transport");
                Error::negotiation(viewer, e)
            })?;

        let entry = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(viewer) {
                drop(sessions);
                tracing::debug!(viewer = %viewer, "Session created concurrently, releasing transport");
                peer.close().await;
                return Ok(false);
            }

            let entry = Arc::new(Mutex::new(ConsumerSession::new(
                viewer.clone(),
                generation,
                peer,
            )));
            sessions.insert(viewer.clone(), Arc::clone(&entry));

            tracing::info!(
                viewer = %viewer,
                generation = generation,
                sessions = sessions.len(),
                "Session created"
            );
            entry
        };

        self.emit(viewer, SessionState::Created);

        let mut session = entry.lock().await;
        self.sync(&entry, &mut session).await;
        Ok(true)
    }

    /// Ask every session to adopt the latest composition.
    ///
    /// Sessions are driven concurrently; each one is serialized by its own
    /// lock. Failed sessions are left alone until rebuilt.
    pub async fn broadcast_composition(self: &Arc<Self>, composition: Arc<Composition>) {
        self.set_composition(composition);

        let entries: Vec<SessionRef> = self.sessions.read().await.values().cloned().collect();
        join_all(entries.iter().map(|entry| async move {
            let mut session = entry.lock().await;
            self.sync(entry, &mut session).await;
        }))
        .await;
    }

    /// Route a viewer's answer to its session
    pub async fn handle_answer(
        self: &Arc<Self>,
        viewer: &ViewerId,
        answer: SessionDescription,
    ) -> Result<()> {
        let entry = self
            .get(viewer)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(viewer.clone()))?;
        let mut session = entry.lock().await;

        match session.accept_answer(answer).await {
            Ok(true) => {
                session.answer_timer.cancel();
                tracing::debug!(viewer = %viewer, generation = session.generation(), "Answer applied");
                if session.take_dirty() {
                    self.sync(&entry, &mut session).await;
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.fail(&entry, &mut session, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Route a viewer's ICE candidate to its session
    pub async fn handle_remote_candidate(
        &self,
        viewer: &ViewerId,
        candidate: IceCandidate,
    ) -> Result<()> {
        let entry = self
            .get(viewer)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(viewer.clone()))?;
        let mut session = entry.lock().await;

        if let Err(e) = session.add_remote_candidate(candidate).await {
            tracing::debug!(viewer = %viewer, error = %e, "Remote candidate rejected");
        }
        Ok(())
    }

    /// Apply an event reported by a transport.
    ///
    /// Events from a transport generation that has been replaced are
    /// dropped.
    pub async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        let Some(entry) = self.get(&event.viewer).await else {
            tracing::trace!(viewer = %event.viewer, "Event for unknown session");
            return;
        };
        let mut session = entry.lock().await;

        if session.generation() != event.generation {
            tracing::debug!(
                viewer = %event.viewer,
                current = session.generation(),
                stale = event.generation,
                "Dropping event from replaced transport"
            );
            return;
        }

        match event.kind {
            PeerEventKind::LocalCandidate(candidate) => {
                self.channel.send(SignalingMessage::IceCandidate {
                    broadcaster_id: Some(self.broadcaster_id.clone()),
                    viewer_id: event.viewer,
                    candidate,
                });
            }
            PeerEventKind::ConnectionState(PeerConnectionState::Connected) => {
                if self.set_state(&mut session, SessionState::Connected) {
                    session.timer.cancel();
                    session.rebuild_attempts = 0;
                }
            }
            PeerEventKind::ConnectionState(PeerConnectionState::Disconnected) => {
                match session.state() {
                    SessionState::Connected => {
                        if self.set_state(&mut session, SessionState::Disconnected) {
                            self.arm_recovery(&mut session);
                        }
                    }
                    // Still negotiating: the window runs without a state change
                    SessionState::Negotiating if !session.timer.is_pending() => {
                        tracing::debug!(viewer = %event.viewer, "Disconnected while negotiating");
                        self.arm_recovery(&mut session);
                    }
                    _ => {}
                }
            }
            PeerEventKind::ConnectionState(
                state @ (PeerConnectionState::Failed | PeerConnectionState::Closed),
            ) => {
                let reason = format!("transport {:?}", state);
                self.fail(&entry, &mut session, &reason).await;
            }
            PeerEventKind::ConnectionState(_) => {}
        }
    }

    /// Rebuild a failed session right away, skipping the cooldown
    pub async fn rebuild(self: &Arc<Self>, viewer: &ViewerId) -> Result<()> {
        let entry = self
            .get(viewer)
            .await
            .ok_or_else(|| RegistryError::SessionNotFound(viewer.clone()))?;
        let mut session = entry.lock().await;

        if session.state() != SessionState::Failed {
            return Err(RegistryError::NotFailed(viewer.clone(), session.state()).into());
        }
        session.timer.cancel();

        if session.rebuild_attempts >= self.config.max_rebuild_attempts {
            self.close_locked(&entry, &mut session).await;
            return Err(RegistryError::RebuildsExhausted(viewer.clone()).into());
        }
        self.rebuild_locked(&entry, &mut session).await
    }

    /// Close and remove a session. Returns false if there was none.
    pub async fn remove(&self, viewer: &ViewerId) -> bool {
        let Some(entry) = self.sessions.write().await.remove(viewer) else {
            return false;
        };
        let mut session = entry.lock().await;
        self.shut(&mut session).await;
        tracing::info!(viewer = %viewer, "Session removed");
        true
    }

    /// Close every session. Safe to call more than once.
    pub async fn close_all(&self) {
        let entries: Vec<SessionRef> = self
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        if entries.is_empty() {
            return;
        }

        let count = entries.len();
        join_all(entries.iter().map(|entry| async move {
            let mut session = entry.lock().await;
            self.shut(&mut session).await;
        }))
        .await;

        tracing::info!(sessions = count, "All sessions closed");
    }

    /// State of a viewer's session
    pub async fn state(&self, viewer: &ViewerId) -> Option<SessionState> {
        let entry = self.get(viewer).await?;
        let state = entry.lock().await.state();
        Some(state)
    }

    /// Viewers with a session, sorted
    pub async fn viewers(&self) -> Vec<ViewerId> {
        let mut viewers: Vec<ViewerId> = self.sessions.read().await.keys().cloned().collect();
        viewers.sort();
        viewers
    }

    /// Number of sessions
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Snapshot of every session, sorted by viewer
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let entries: Vec<SessionRef> = self.sessions.read().await.values().cloned().collect();
        let mut infos = Vec::with_capacity(entries.len());
        for entry in entries {
            infos.push(entry.lock().await.info());
        }
        infos.sort_by(|a, b| a.viewer.cmp(&b.viewer));
        infos
    }

    async fn get(&self, viewer: &ViewerId) -> Option<SessionRef> {
        self.sessions.read().await.get(viewer).cloned()
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn sink(&self, viewer: &ViewerId, generation: u64) -> PeerEventSink {
        PeerEventSink::new(viewer.clone(), generation, self.peer_events.clone())
    }

    fn emit(&self, viewer: &ViewerId, state: SessionState) {
        let _ = self.session_events.send(SessionEvent {
            viewer: viewer.clone(),
            state,
        });
    }

    /// Transition and report. Returns true if the state changed.
    fn set_state(&self, session: &mut ConsumerSession, next: SessionState) -> bool {
        match session.transition(next) {
            Ok(previous) if previous != next => {
                tracing::info!(
                    viewer = %session.viewer(),
                    generation = session.generation(),
                    from = %previous,
                    to = %next,
                    "Session state changed"
                );
                self.emit(session.viewer(), next);
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring transition");
                false
            }
        }
    }

    /// Bring one session in line with the latest composition
    async fn sync(self: &Arc<Self>, entry: &SessionRef, session: &mut ConsumerSession) {
        if matches!(session.state(), SessionState::Failed | SessionState::Closed) {
            return;
        }
        let Some(composition) = self.composition() else {
            return;
        };

        match session.apply_composition(&composition).await {
            Ok(Some(offer)) => {
                if session.state() == SessionState::Created {
                    self.set_state(session, SessionState::Negotiating);
                }
                self.arm_answer_timeout(session);
                let outcome = self.channel.send(SignalingMessage::Offer {
                    broadcaster_id: self.broadcaster_id.clone(),
                    viewer_id: session.viewer().clone(),
                    offer,
                });
                tracing::debug!(
                    viewer = %session.viewer(),
                    revision = composition.revision(),
                    outcome = ?outcome,
                    "Offer sent"
                );
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(viewer = %session.viewer(), error = %e, "Renegotiation failed");
                self.fail(entry, session, &e.to_string()).await;
            }
        }
    }

    /// Mark a session failed and schedule its rebuild
    async fn fail(self: &Arc<Self>, entry: &SessionRef, session: &mut ConsumerSession, reason: &str) {
        if !self.set_state(session, SessionState::Failed) {
            return;
        }
        tracing::warn!(
            viewer = %session.viewer(),
            generation = session.generation(),
            reason = reason,
            "Session failed"
        );
        session.timer.cancel();
        session.answer_timer.cancel();
        self.schedule_rebuild(entry, session).await;
    }

    /// Schedule the next rebuild of a failed session, or close it once the
    /// rebuild bound is reached
    async fn schedule_rebuild(self: &Arc<Self>, entry: &SessionRef, session: &mut ConsumerSession) {
        if session.rebuild_attempts >= self.config.max_rebuild_attempts {
            tracing::warn!(
                viewer = %session.viewer(),
                attempts = session.rebuild_attempts,
                "Rebuild bound reached, closing session"
            );
            self.close_locked(entry, session).await;
            return;
        }

        let attempt = session.rebuild_attempts + 1;
        let delay = backoff(
            self.config.rebuild_cooldown,
            self.config.rebuild_max_cooldown,
            attempt,
        );
        tracing::info!(
            viewer = %session.viewer(),
            attempt = attempt,
            delay_ms = delay.as_millis() as u64,
            "Rebuild scheduled"
        );

        let registry = Arc::downgrade(self);
        let viewer = session.viewer().clone();
        let generation = session.generation();
        session.timer.reschedule(delay, async move {
            Self::rebuild_after_cooldown(registry, viewer, generation).await;
        });
    }

    // Boxed: the cooldown task re-enters `fail` through the rebuild
    fn rebuild_after_cooldown(
        registry: Weak<Self>,
        viewer: ViewerId,
        generation: u64,
    ) -> BoxFuture<'static, ()> {
        async move {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            let Some(entry) = registry.get(&viewer).await else {
                return;
            };
            let mut session = entry.lock().await;
            if session.generation() != generation || session.state() != SessionState::Failed {
                return;
            }
            session.timer.disarm();
            let _ = registry.rebuild_locked(&entry, &mut session).await;
        }
        .boxed()
    }

    /// Fail the session unless it reaches `Connected` within the recovery window
    fn arm_recovery(self: &Arc<Self>, session: &mut ConsumerSession) {
        let registry = Arc::downgrade(self);
        let viewer = session.viewer().clone();
        let generation = session.generation();
        session
            .timer
            .reschedule(self.config.recovery_window, async move {
                if let Some(registry) = registry.upgrade() {
                    registry.recovery_expired(&viewer, generation).await;
                }
            });
    }

    async fn recovery_expired(self: &Arc<Self>, viewer: &ViewerId, generation: u64) {
        let Some(entry) = self.get(viewer).await else {
            return;
        };
        let mut session = entry.lock().await;
        if session.generation() != generation
            || !matches!(
                session.state(),
                SessionState::Disconnected | SessionState::Negotiating
            )
        {
            return;
        }
        session.timer.disarm();
        self.fail(&entry, &mut session, "recovery window exceeded").await;
    }

    /// Fail the session if the offer just sent is never answered
    fn arm_answer_timeout(self: &Arc<Self>, session: &mut ConsumerSession) {
        let registry = Arc::downgrade(self);
        let viewer = session.viewer().clone();
        let generation = session.generation();
        let offer = session.offers_sent();
        session
            .answer_timer
            .reschedule(self.config.negotiation_timeout, async move {
                if let Some(registry) = registry.upgrade() {
                    registry.answer_expired(&viewer, generation, offer).await;
                }
            });
    }

    async fn answer_expired(self: &Arc<Self>, viewer: &ViewerId, generation: u64, offer: u64) {
        let Some(entry) = self.get(viewer).await else {
            return;
        };
        let mut session = entry.lock().await;
        if session.generation() != generation
            || session.offers_sent() != offer
            || !session.is_awaiting_answer()
        {
            return;
        }
        session.answer_timer.disarm();
        tracing::warn!(
            viewer = %viewer,
            generation = generation,
            timeout_ms = self.config.negotiation_timeout.as_millis() as u64,
            "Offer not answered in time"
        );
        self.fail(&entry, &mut session, "answer timed out").await;
    }

    /// Replace a failed session with a fresh one and replay the composition.
    ///
    /// The old transport is closed and never reused; queued signaling for
    /// the viewer is dropped.
    async fn rebuild_locked(
        self: &Arc<Self>,
        entry: &SessionRef,
        session: &mut ConsumerSession,
    ) -> Result<()> {
        let viewer = session.viewer().clone();
        session.rebuild_attempts += 1;
        self.channel.discard_pending(&viewer);

        let generation = self.next_generation();
        let peer = match self.factory.create(self.sink(&viewer, generation)).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(viewer = %viewer, error = %e, "Rebuild could not allocate transport");
                self.schedule_rebuild(entry, session).await;
                return Err(Error::negotiation(&viewer, e));
            }
        };

        let old = session.renew(generation, peer);
        old.close().await;

        tracing::info!(
            viewer = %viewer,
            generation = generation,
            attempt = session.rebuild_attempts,
            "Session rebuilt"
        );
        self.emit(&viewer, SessionState::Created);
        self.sync(entry, session).await;
        Ok(())
    }

    /// Close a session and remove it from the map
    async fn close_locked(&self, entry: &SessionRef, session: &mut ConsumerSession) {
        {
            let mut sessions = self.sessions.write().await;
            if sessions
                .get(session.viewer())
                .is_some_and(|current| Arc::ptr_eq(current, entry))
            {
                sessions.remove(session.viewer());
            }
        }
        self.shut(session).await;
    }

    /// Cancel timers, close the transport, drop queued signaling
    async fn shut(&self, session: &mut ConsumerSession) {
        session.timer.cancel();
        session.answer_timer.cancel();
        session.peer().close().await;
        self.set_state(session, SessionState::Closed);
        self.channel.discard_pending(session.viewer());
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("broadcaster_id", &self.broadcaster_id)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::media::{MediaTrack, SenderSlot, SourceKind};
    use crate::signaling::ChannelConfig;
    use crate::testing::{FakePeer, FakePeerFactory, MemoryConnector, SenderOp};

    struct Harness {
        registry: Arc<SessionRegistry>,
        events: RegistryEvents,
        factory: Arc<FakePeerFactory>,
        channel: SignalingChannel,
    }

    impl Harness {
        fn new(config: RegistryConfig) -> Self {
            let (channel, _) = SignalingChannel::new(
                ChannelConfig::default(),
                Arc::new(MemoryConnector::new()),
            );
            let factory = Arc::new(FakePeerFactory::new());
            let (registry, events) = SessionRegistry::new(
                config,
                BroadcasterId::new("b1"),
                channel.clone(),
                factory.clone(),
            );
            Self {
                registry,
                events,
                factory,
                channel,
            }
        }

        fn peer(&self, viewer: &str) -> Arc<FakePeer> {
            self.factory.peer(&ViewerId::new(viewer)).unwrap()
        }

        /// Deliver every peer event reported so far
        async fn pump(&mut self) {
            while let Ok(event) = self.events.peer.try_recv() {
                self.registry.handle_peer_event(event).await;
            }
        }

        async fn connect(&mut self, viewer: &str) {
            let id = ViewerId::new(viewer);
            self.registry.ensure(&id).await.unwrap();
            self.registry
                .handle_answer(&id, SessionDescription::answer("a"))
                .await
                .unwrap();
            self.peer(viewer).emit_state(PeerConnectionState::Connected);
            self.pump().await;
            assert_eq!(self.registry.state(&id).await, Some(SessionState::Connected));
        }

        async fn state(&self, viewer: &str) -> Option<SessionState> {
            self.registry.state(&ViewerId::new(viewer)).await
        }
    }

    fn camera_composition(revision: u64) -> (Arc<Composition>, MediaTrack) {
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let mic = MediaTrack::new(SourceKind::Microphone, "mic");
        (
            Arc::new(Composition::new(revision, cam.clone(), None, Some(mic))),
            cam,
        )
    }

    fn fast_config() -> RegistryConfig {
        RegistryConfig::default()
            .recovery_window(Duration::from_secs(1))
            .rebuild_cooldown(Duration::from_secs(2), Duration::from_secs(30))
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        let v1 = ViewerId::new("v1");

        assert!(h.registry.ensure(&v1).await.unwrap());
        assert_eq!(h.registry.state(&v1).await, Some(SessionState::Negotiating));
        assert!(!h.registry.ensure(&v1).await.unwrap());

        assert_eq!(h.factory.created(), 1);
        assert_eq!(h.peer("v1").offers_created(), 1);
        // Channel is down, so the single offer is queued
        assert_eq!(h.channel.pending_for(&v1), 1);
    }

    #[tokio::test]
    async fn test_ensure_when_connected_sends_no_offer() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;

        assert!(!h.registry.ensure(&ViewerId::new("v1")).await.unwrap());
        assert_eq!(h.peer("v1").offers_created(), 1);
    }

    #[tokio::test]
    async fn test_ensure_without_composition_waits() {
        let h = Harness::new(fast_config());
        let v1 = ViewerId::new("v1");

        h.registry.ensure(&v1).await.unwrap();
        assert_eq!(h.registry.state(&v1).await, Some(SessionState::Created));
        assert_eq!(h.peer("v1").offers_created(), 0);

        let (comp, _) = camera_composition(1);
        h.registry.broadcast_composition(comp).await;
        assert_eq!(h.registry.state(&v1).await, Some(SessionState::Negotiating));
        assert_eq!(h.peer("v1").offers_created(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_replaces_and_adds_senders() {
        let mut h = Harness::new(fast_config());
        let (comp, cam) = camera_composition(1);
        let mic = comp.audio().unwrap().clone();
        h.registry.set_composition(comp);
        h.connect("v1").await;

        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        let next = Arc::new(Composition::new(2, screen.clone(), Some(cam.clone()), Some(mic.clone())));
        h.registry.broadcast_composition(next).await;

        let peer = h.peer("v1");
        assert_eq!(
            peer.sender_ops(),
            vec![
                SenderOp::Add(SenderSlot::PrimaryVideo),
                SenderOp::Add(SenderSlot::Audio),
                SenderOp::Replace(SenderSlot::PrimaryVideo),
                SenderOp::Add(SenderSlot::SecondaryVideo),
            ]
        );
        assert_eq!(
            peer.senders(),
            vec![
                (SenderSlot::PrimaryVideo, screen.id()),
                (SenderSlot::SecondaryVideo, cam.id()),
                (SenderSlot::Audio, mic.id()),
            ]
        );
        assert_eq!(peer.offers_created(), 2);
        assert_eq!(h.state("v1").await, Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn test_changes_during_outstanding_offer_coalesce() {
        let h = Harness::new(fast_config());
        let (comp, cam) = camera_composition(1);
        h.registry.set_composition(comp);
        let v1 = ViewerId::new("v1");
        h.registry.ensure(&v1).await.unwrap();

        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        h.registry
            .broadcast_composition(Arc::new(Composition::new(2, cam.clone(), None, None)))
            .await;
        h.registry
            .broadcast_composition(Arc::new(Composition::new(3, screen.clone(), Some(cam), None)))
            .await;
        assert_eq!(h.peer("v1").offers_created(), 1);

        h.registry
            .handle_answer(&v1, SessionDescription::answer("a"))
            .await
            .unwrap();

        let peer = h.peer("v1");
        assert_eq!(peer.offers_created(), 2);
        assert_eq!(peer.senders()[0], (SenderSlot::PrimaryVideo, screen.id()));
    }

    #[tokio::test]
    async fn test_stale_answer_ignored() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;

        h.registry
            .handle_answer(&ViewerId::new("v1"), SessionDescription::answer("late"))
            .await
            .unwrap();
        assert_eq!(h.peer("v1").answers_applied(), 1);
    }

    #[tokio::test]
    async fn test_local_candidates_relayed() {
        let mut h = Harness::new(fast_config());
        let v1 = ViewerId::new("v1");
        h.registry.ensure(&v1).await.unwrap();

        h.peer("v1").emit_candidate(IceCandidate::new("c1"));
        h.peer("v1").emit_candidate(IceCandidate::new("c2"));
        h.pump().await;

        assert_eq!(h.channel.pending_for(&v1), 2);
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("a").await;
        h.connect("b").await;

        let b = h.peer("b");
        let b_senders = b.senders();
        let b_offers = b.offers_created();

        h.peer("a").emit_state(PeerConnectionState::Failed);
        h.pump().await;

        assert_eq!(h.state("a").await, Some(SessionState::Failed));
        assert_eq!(h.state("b").await, Some(SessionState::Connected));
        assert_eq!(b.senders(), b_senders);
        assert_eq!(b.offers_created(), b_offers);
        assert!(!b.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_rebuilt_after_cooldown() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;
        let old = h.peer("v1");

        old.emit_state(PeerConnectionState::Failed);
        h.pump().await;
        assert_eq!(h.state("v1").await, Some(SessionState::Failed));

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Failed));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Negotiating));

        let fresh = h.peer("v1");
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(old.is_closed());
        assert!(fresh.generation() > old.generation());
        assert_eq!(fresh.offers_created(), 1);
        assert_eq!(h.factory.created(), 2);

        // Events from the discarded transport are ignored
        old.emit_state(PeerConnectionState::Connected);
        h.pump().await;
        assert_eq!(h.state("v1").await, Some(SessionState::Negotiating));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_window() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;
        h.connect("v2").await;

        // v1 recovers inside the window
        h.peer("v1").emit_state(PeerConnectionState::Disconnected);
        h.pump().await;
        assert_eq!(h.state("v1").await, Some(SessionState::Disconnected));
        h.peer("v1").emit_state(PeerConnectionState::Connected);
        h.pump().await;

        // v2 does not
        h.peer("v2").emit_state(PeerConnectionState::Disconnected);
        h.pump().await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Connected));
        assert_eq!(h.state("v2").await, Some(SessionState::Failed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_answer_times_out_and_resyncs() {
        let mut h = Harness::new(fast_config().negotiation_timeout(Duration::from_secs(5)));
        let (comp, cam) = camera_composition(1);
        let mic = comp.audio().unwrap().clone();
        h.registry.set_composition(comp);
        h.connect("v1").await;
        let old = h.peer("v1");

        // The first answer arrived, so its deadline never fires
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Connected));

        // Renegotiation whose answer is lost, then a screen share behind it
        let placeholder = MediaTrack::new(SourceKind::Placeholder, "placeholder");
        h.registry
            .broadcast_composition(Arc::new(Composition::new(2, placeholder, None, Some(mic.clone()))))
            .await;
        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        h.registry
            .broadcast_composition(Arc::new(Composition::new(3, screen.clone(), Some(cam), Some(mic))))
            .await;
        assert_eq!(old.offers_created(), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Connected));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Failed));

        // Rebuilt after the cooldown with the latest composition
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Negotiating));
        let fresh = h.peer("v1");
        assert!(old.is_closed());
        assert_eq!(fresh.senders()[0], (SenderSlot::PrimaryVideo, screen.id()));
        assert_eq!(fresh.senders().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_after_renegotiation_cancels_deadline() {
        let mut h = Harness::new(fast_config().negotiation_timeout(Duration::from_secs(5)));
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;

        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        h.registry
            .broadcast_composition(Arc::new(Composition::new(2, screen, None, None)))
            .await;
        h.registry
            .handle_answer(&ViewerId::new("v1"), SessionDescription::answer("b"))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.state("v1").await, Some(SessionState::Connected));
        assert_eq!(h.factory.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_negotiating_starts_recovery() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.registry.ensure(&ViewerId::new("a")).await.unwrap();
        h.registry.ensure(&ViewerId::new("b")).await.unwrap();

        h.peer("a").emit_state(PeerConnectionState::Disconnected);
        h.peer("b").emit_state(PeerConnectionState::Disconnected);
        h.pump().await;
        assert_eq!(h.state("a").await, Some(SessionState::Negotiating));

        // b comes up inside the window, a does not
        h.registry
            .handle_answer(&ViewerId::new("b"), SessionDescription::answer("a"))
            .await
            .unwrap();
        h.peer("b").emit_state(PeerConnectionState::Connected);
        h.pump().await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(h.state("a").await, Some(SessionState::Failed));
        assert_eq!(h.state("b").await, Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn test_concurrent_ensure_keeps_one_session() {
        let h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        let v1 = ViewerId::new("v1");

        let (a, b) = tokio::join!(h.registry.ensure(&v1), h.registry.ensure(&v1));
        assert_eq!(a.unwrap() as u8 + b.unwrap() as u8, 1);
        assert_eq!(h.registry.len().await, 1);

        // A transport allocated by the losing call is released
        let peers = h.factory.peers(&v1);
        let open: Vec<_> = peers.iter().filter(|p| !p.is_closed()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].offers_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuilds_are_bounded() {
        let mut h = Harness::new(fast_config().max_rebuild_attempts(2));
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        let v1 = ViewerId::new("v1");
        h.registry.ensure(&v1).await.unwrap();

        for _ in 0..2 {
            h.peer("v1").emit_state(PeerConnectionState::Failed);
            h.pump().await;
            assert_eq!(h.registry.state(&v1).await, Some(SessionState::Failed));
            tokio::time::sleep(Duration::from_secs(10)).await;
            assert_eq!(h.registry.state(&v1).await, Some(SessionState::Negotiating));
        }

        h.peer("v1").emit_state(PeerConnectionState::Failed);
        h.pump().await;

        assert_eq!(h.registry.state(&v1).await, None);
        assert!(h.peer("v1").is_closed());
        assert_eq!(h.factory.created(), 3);
        assert_eq!(h.channel.pending_for(&v1), 0);

        let mut states = Vec::new();
        while let Ok(event) = h.events.sessions.try_recv() {
            states.push(event.state);
        }
        assert_eq!(states.last(), Some(&SessionState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_resets_rebuild_attempts() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;

        h.peer("v1").emit_state(PeerConnectionState::Failed);
        h.pump().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(h.registry.snapshot().await[0].rebuild_attempts, 1);

        h.peer("v1").emit_state(PeerConnectionState::Connected);
        h.pump().await;
        let info = &h.registry.snapshot().await[0];
        assert_eq!(info.state, SessionState::Connected);
        assert_eq!(info.rebuild_attempts, 0);
    }

    #[tokio::test]
    async fn test_explicit_rebuild_requires_failed() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;
        let v1 = ViewerId::new("v1");

        let err = h.registry.rebuild(&v1).await.unwrap_err();
        assert!(matches!(err, Error::Registry(RegistryError::NotFailed(_, SessionState::Connected))));

        h.peer("v1").emit_state(PeerConnectionState::Failed);
        h.pump().await;
        h.registry.rebuild(&v1).await.unwrap();
        assert_eq!(h.registry.state(&v1).await, Some(SessionState::Negotiating));
        assert_eq!(h.factory.created(), 2);
    }

    #[tokio::test]
    async fn test_remove_discards_queue() {
        let h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        let v1 = ViewerId::new("v1");
        h.registry.ensure(&v1).await.unwrap();
        assert_eq!(h.channel.pending_for(&v1), 1);

        assert!(h.registry.remove(&v1).await);
        assert!(!h.registry.remove(&v1).await);
        assert_eq!(h.channel.pending_for(&v1), 0);
        assert!(h.peer("v1").is_closed());
        assert!(h.registry.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_is_idempotent_and_cancels_timers() {
        let mut h = Harness::new(fast_config());
        let (comp, _) = camera_composition(1);
        h.registry.set_composition(comp);
        h.connect("v1").await;
        h.connect("v2").await;

        h.peer("v1").emit_state(PeerConnectionState::Failed);
        h.pump().await;

        h.registry.close_all().await;
        h.registry.close_all().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.registry.is_empty().await);
        assert_eq!(h.factory.created(), 2);
        assert!(h.peer("v1").is_closed());
        assert!(h.peer("v2").is_closed());
    }

    #[tokio::test]
    async fn test_factory_failure_is_contained() {
        let h = Harness::new(fast_config());
        h.factory.fail_creates(true);

        let err = h.registry.ensure(&ViewerId::new("v1")).await.unwrap_err();
        assert!(matches!(err, Error::SessionNegotiationFailed { .. }));
        assert!(h.registry.is_empty().await);
    }
}
