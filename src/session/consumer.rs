//! Per-viewer session
//!
//! A [`ConsumerSession`] is one viewer's transport plus the bookkeeping that
//! keeps renegotiation orderly:
//!
//! - the sender set, keyed by slot, as last applied to the transport
//! - the revision of the composition those senders reflect
//! - whether an offer is outstanding; compositions arriving meanwhile only
//!   mark the session dirty and are applied once the answer lands
//! - remote candidates received before the first answer, applied right
//!   after it in arrival order
//!
//! State transitions are driven by the registry, which owns every session.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::ids::ViewerId;
use crate::media::{Composition, SenderSlot, TrackId};
use crate::registry::RegistryError;
use crate::renegotiate::{plan_sender_changes, SenderChange};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::stats::SessionInfo;
use crate::task::RetryTask;

use super::peer::PeerTransport;
use super::state::SessionState;

/// One viewer's session
pub struct ConsumerSession {
    /// Viewer id
    viewer: ViewerId,

    /// Transport generation; bumped by every rebuild
    generation: u64,

    /// Current state
    state: SessionState,

    /// When `state` was entered
    state_changed_at: Instant,

    /// Media transport for this generation
    peer: Arc<dyn PeerTransport>,

    /// Sender set as applied to `peer`
    senders: BTreeMap<SenderSlot, TrackId>,

    /// Revision of the composition `senders` reflects
    applied_revision: Option<u64>,

    /// An offer was sent and its answer has not been applied
    awaiting_answer: bool,

    /// A composition arrived while `awaiting_answer`
    dirty: bool,

    /// At least one answer has been applied on this transport
    answered: bool,

    /// Remote candidates received before the first answer
    remote_candidates: Vec<IceCandidate>,

    /// Recovery window or rebuild cooldown
    pub(crate) timer: RetryTask,

    /// Deadline for the answer to the outstanding offer
    pub(crate) answer_timer: RetryTask,

    /// Rebuilds since the session last reached `Connected`
    pub(crate) rebuild_attempts: u32,

    /// Offers created across all generations
    offers_sent: u64,
}

impl ConsumerSession {
    /// Create a session in `Created`
    pub fn new(viewer: ViewerId, generation: u64, peer: Arc<dyn PeerTransport>) -> Self {
        Self {
            viewer,
            generation,
            state: SessionState::Created,
            state_changed_at: Instant::now(),
            peer,
            senders: BTreeMap::new(),
            applied_revision: None,
            awaiting_answer: false,
            dirty: false,
            answered: false,
            remote_candidates: Vec::new(),
            timer: RetryTask::new(),
            answer_timer: RetryTask::new(),
            rebuild_attempts: 0,
            offers_sent: 0,
        }
    }

    /// Replace this session with a fresh one on a new transport.
    ///
    /// Counters that span generations (offers sent, rebuild attempts) are
    /// carried over. The old transport is returned so it can be closed.
    pub(crate) fn renew(
        &mut self,
        generation: u64,
        peer: Arc<dyn PeerTransport>,
    ) -> Arc<dyn PeerTransport> {
        let mut fresh = ConsumerSession::new(self.viewer.clone(), generation, peer);
        fresh.offers_sent = self.offers_sent;
        fresh.rebuild_attempts = self.rebuild_attempts;
        // The old timer belongs to the task running this rebuild; disarm, don't abort
        self.timer.disarm();

        let old = std::mem::replace(self, fresh);
        Arc::clone(&old.peer)
    }

    pub fn viewer(&self) -> &ViewerId {
        &self.viewer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> &Arc<dyn PeerTransport> {
        &self.peer
    }

    pub fn applied_revision(&self) -> Option<u64> {
        self.applied_revision
    }

    pub fn is_awaiting_answer(&self) -> bool {
        self.awaiting_answer
    }

    /// Offers created across all generations
    pub fn offers_sent(&self) -> u64 {
        self.offers_sent
    }

    /// Move to `next` if the transition is legal
    pub fn transition(&mut self, next: SessionState) -> std::result::Result<SessionState, RegistryError> {
        if self.state == next {
            return Ok(next);
        }
        if !self.state.can_transition_to(next) {
            return Err(RegistryError::IllegalTransition {
                viewer: self.viewer.clone(),
                from: self.state,
                to: next,
            });
        }

        let previous = std::mem::replace(&mut self.state, next);
        self.state_changed_at = Instant::now();
        tracing::debug!(viewer = %self.viewer, from = %previous, to = %next, "Session state changed");
        Ok(previous)
    }

    /// Bring the senders in line with `composition`.
    ///
    /// Returns the offer to send, or `None` when nothing needs negotiating:
    /// the composition is not newer than what was applied, the senders
    /// already match, or an offer is still outstanding (the session is then
    /// marked dirty and resynced after the answer).
    pub async fn apply_composition(
        &mut self,
        composition: &Composition,
    ) -> Result<Option<SessionDescription>> {
        if self
            .applied_revision
            .is_some_and(|applied| composition.revision() <= applied)
        {
            return Ok(None);
        }

        if self.awaiting_answer {
            tracing::debug!(viewer = %self.viewer, revision = composition.revision(), "Offer outstanding, deferring composition");
            self.dirty = true;
            return Ok(None);
        }

        let changes = plan_sender_changes(&self.senders, composition);
        if changes.is_empty() {
            self.applied_revision = Some(composition.revision());
            return Ok(None);
        }

        for change in &changes {
            let applied = match change {
                SenderChange::Replace { slot, track } => self.peer.replace_track(*slot, track).await,
                SenderChange::Add { slot, track } => self.peer.add_sender(*slot, track).await,
                SenderChange::Remove { slot } => self.peer.remove_sender(*slot).await,
            };
            applied.map_err(|e| Error::negotiation(&self.viewer, e))?;

            match change {
                SenderChange::Replace { slot, track } | SenderChange::Add { slot, track } => {
                    self.senders.insert(*slot, track.id());
                }
                SenderChange::Remove { slot } => {
                    self.senders.remove(slot);
                }
            }
        }

        let offer = self
            .peer
            .create_offer()
            .await
            .map_err(|e| Error::negotiation(&self.viewer, e))?;

        self.applied_revision = Some(composition.revision());
        self.awaiting_answer = true;
        self.dirty = false;
        self.offers_sent += 1;

        tracing::debug!(
            viewer = %self.viewer,
            revision = composition.revision(),
            changes = changes.len(),
            "Senders updated, offer created"
        );
        Ok(Some(offer))
    }

    /// Apply the viewer's answer.
    ///
    /// Returns false if no offer was outstanding (the answer is stale and
    /// was ignored). Buffered remote candidates are applied afterwards.
    pub async fn accept_answer(&mut self, answer: SessionDescription) -> Result<bool> {
        if !self.awaiting_answer {
            tracing::debug!(viewer = %self.viewer, "No offer outstanding, ignoring answer");
            return Ok(false);
        }

        self.peer
            .apply_answer(answer)
            .await
            .map_err(|e| Error::negotiation(&self.viewer, e))?;
        self.awaiting_answer = false;
        self.answered = true;

        for candidate in std::mem::take(&mut self.remote_candidates) {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                tracing::debug!(viewer = %self.viewer, error = %e, "Buffered candidate rejected");
            }
        }
        Ok(true)
    }

    /// Take the dirty flag set while an offer was outstanding
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Apply or buffer a candidate from the viewer
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.answered {
            self.remote_candidates.push(candidate);
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await
    }

    /// Number of remote candidates waiting for the first answer
    pub fn buffered_candidates(&self) -> usize {
        self.remote_candidates.len()
    }

    /// Snapshot for statistics
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            viewer: self.viewer.clone(),
            state: self.state,
            generation: self.generation,
            applied_revision: self.applied_revision,
            offers_sent: self.offers_sent,
            rebuild_attempts: self.rebuild_attempts,
            in_state_for: self.state_changed_at.elapsed(),
        }
    }
}

impl std::fmt::Debug for ConsumerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerSession")
            .field("viewer", &self.viewer)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("applied_revision", &self.applied_revision)
            .field("awaiting_answer", &self.awaiting_answer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, SourceKind};
    use crate::testing::FakePeer;

    fn session() -> (ConsumerSession, Arc<FakePeer>) {
        let peer = Arc::new(FakePeer::new());
        let session = ConsumerSession::new(ViewerId::new("v1"), 1, peer.clone());
        (session, peer)
    }

    #[tokio::test]
    async fn test_first_composition_adds_senders_and_offers() {
        let (mut session, peer) = session();
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let mic = MediaTrack::new(SourceKind::Microphone, "mic");
        let comp = Composition::new(1, cam.clone(), None, Some(mic.clone()));

        let offer = session.apply_composition(&comp).await.unwrap();
        assert!(offer.is_some());
        assert_eq!(
            peer.senders(),
            vec![(SenderSlot::PrimaryVideo, cam.id()), (SenderSlot::Audio, mic.id())]
        );
        assert_eq!(peer.offers_created(), 1);
        assert!(session.is_awaiting_answer());
        assert_eq!(session.applied_revision(), Some(1));
    }

    #[tokio::test]
    async fn test_composition_while_awaiting_answer_marks_dirty() {
        let (mut session, peer) = session();
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let screen = MediaTrack::new(SourceKind::Screen, "screen");

        session
            .apply_composition(&Composition::new(1, cam.clone(), None, None))
            .await
            .unwrap();
        let deferred = session
            .apply_composition(&Composition::new(2, screen, Some(cam), None))
            .await
            .unwrap();

        assert!(deferred.is_none());
        assert_eq!(peer.offers_created(), 1);

        assert!(session.accept_answer(SessionDescription::answer("a")).await.unwrap());
        assert!(session.take_dirty());
        assert!(!session.take_dirty());
    }

    #[tokio::test]
    async fn test_same_tracks_is_noop() {
        let (mut session, peer) = session();
        let cam = MediaTrack::new(SourceKind::Camera, "cam");

        session
            .apply_composition(&Composition::new(1, cam.clone(), None, None))
            .await
            .unwrap();
        session.accept_answer(SessionDescription::answer("a")).await.unwrap();

        let again = session
            .apply_composition(&Composition::new(2, cam, None, None))
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(peer.offers_created(), 1);
        assert_eq!(session.applied_revision(), Some(2));
    }

    #[tokio::test]
    async fn test_stale_revision_ignored() {
        let (mut session, peer) = session();
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let other = MediaTrack::new(SourceKind::Placeholder, "placeholder");

        session
            .apply_composition(&Composition::new(5, cam, None, None))
            .await
            .unwrap();
        session.accept_answer(SessionDescription::answer("a")).await.unwrap();

        let stale = session
            .apply_composition(&Composition::new(4, other, None, None))
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(peer.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_stale_answer_ignored() {
        let (mut session, peer) = session();
        assert!(!session.accept_answer(SessionDescription::answer("a")).await.unwrap());
        assert_eq!(peer.answers_applied(), 0);
    }

    #[tokio::test]
    async fn test_remote_candidates_buffered_until_answer() {
        let (mut session, peer) = session();
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        session
            .apply_composition(&Composition::new(1, cam, None, None))
            .await
            .unwrap();

        session.add_remote_candidate(IceCandidate::new("c1")).await.unwrap();
        session.add_remote_candidate(IceCandidate::new("c2")).await.unwrap();
        assert_eq!(session.buffered_candidates(), 2);
        assert!(peer.remote_candidates().is_empty());

        session.accept_answer(SessionDescription::answer("a")).await.unwrap();
        assert_eq!(session.buffered_candidates(), 0);
        assert_eq!(
            peer.remote_candidates(),
            vec![IceCandidate::new("c1"), IceCandidate::new("c2")]
        );

        session.add_remote_candidate(IceCandidate::new("c3")).await.unwrap();
        assert_eq!(peer.remote_candidates().len(), 3);
    }

    #[tokio::test]
    async fn test_peer_failure_is_negotiation_error() {
        let (mut session, peer) = session();
        peer.fail_offers(true);
        let cam = MediaTrack::new(SourceKind::Camera, "cam");

        let err = session
            .apply_composition(&Composition::new(1, cam, None, None))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionNegotiationFailed { .. }));
        assert!(!session.is_awaiting_answer());
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let peer = Arc::new(FakePeer::new());
        let mut session = ConsumerSession::new(ViewerId::new("v1"), 1, peer);

        assert!(session.transition(SessionState::Connected).is_err());
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(
            session.transition(SessionState::Negotiating).unwrap(),
            SessionState::Created
        );
    }

    #[tokio::test]
    async fn test_renew_keeps_counters_and_returns_old_peer() {
        let (mut session, old_peer) = session();
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        session
            .apply_composition(&Composition::new(1, cam, None, None))
            .await
            .unwrap();
        session.rebuild_attempts = 2;

        let new_peer = Arc::new(FakePeer::new());
        let old = session.renew(2, new_peer);

        let old_peer: Arc<dyn PeerTransport> = old_peer;
        assert!(Arc::ptr_eq(&old, &old_peer));
        assert_eq!(session.generation(), 2);
        assert_eq!(session.state(), SessionState::Created);
        assert_eq!(session.applied_revision(), None);
        assert_eq!(session.info().offers_sent, 1);
        assert_eq!(session.info().rebuild_attempts, 2);
    }
}
