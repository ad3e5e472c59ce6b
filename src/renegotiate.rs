//! Renegotiation
//!
//! While broadcasting, every new composition is pushed to every viewer
//! session. Per session the sender set is diffed against the composition:
//!
//! - same track in a slot: nothing to do
//! - slot occupied by another track: replace the track in place
//! - slot newly occupied: add a sender
//! - slot vacated: remove the sender
//!
//! and, if anything changed, one fresh offer is sent.
//!
//! [`RenegotiationCoordinator`] watches the engine's composition channel and
//! starts one registry round per change. Rounds run concurrently; the
//! per-session lock inside the registry keeps each viewer's changes in order
//! while viewers proceed independently.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::media::{Composition, MediaTrack, SenderSlot, TrackId};
use crate::registry::SessionRegistry;

/// One sender mutation
#[derive(Debug, Clone, PartialEq)]
pub enum SenderChange {
    /// Swap the track of an existing sender
    Replace { slot: SenderSlot, track: MediaTrack },
    /// Add a sender for a newly occupied slot
    Add { slot: SenderSlot, track: MediaTrack },
    /// Remove the sender of a vacated slot
    Remove { slot: SenderSlot },
}

impl SenderChange {
    pub fn slot(&self) -> SenderSlot {
        match self {
            SenderChange::Replace { slot, .. }
            | SenderChange::Add { slot, .. }
            | SenderChange::Remove { slot } => *slot,
        }
    }
}

/// Diff the current senders against `composition`, in wire order
pub fn plan_sender_changes(
    senders: &BTreeMap<SenderSlot, TrackId>,
    composition: &Composition,
) -> Vec<SenderChange> {
    SenderSlot::ALL
        .into_iter()
        .filter_map(
            |slot| match (senders.get(&slot), composition.track(slot)) {
                (Some(current), Some(track)) if *current == track.id() => None,
                (Some(_), Some(track)) => Some(SenderChange::Replace {
                    slot,
                    track: track.clone(),
                }),
                (None, Some(track)) => Some(SenderChange::Add {
                    slot,
                    track: track.clone(),
                }),
                (Some(_), None) => Some(SenderChange::Remove { slot }),
                (None, None) => None,
            },
        )
        .collect()
}

/// Pushes composition changes to the registry while broadcasting
#[derive(Debug)]
pub struct RenegotiationCoordinator {
    handle: JoinHandle<()>,
}

impl RenegotiationCoordinator {
    /// Start forwarding compositions from `updates` to `registry`.
    ///
    /// The composition current at spawn time is forwarded immediately.
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        mut updates: watch::Receiver<Option<Arc<Composition>>>,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut rounds = JoinSet::new();

            let initial = updates.borrow_and_update().clone();
            if let Some(composition) = initial {
                let registry = Arc::clone(&registry);
                rounds.spawn(async move { registry.broadcast_composition(composition).await });
            }

            loop {
                tokio::select! {
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let Some(composition) = updates.borrow_and_update().clone() else {
                            continue;
                        };
                        tracing::debug!(revision = composition.revision(), "Renegotiating viewers");
                        let registry = Arc::clone(&registry);
                        rounds.spawn(async move { registry.broadcast_composition(composition).await });
                    }
                    Some(done) = rounds.join_next() => {
                        if let Err(e) = done {
                            tracing::warn!(error = %e, "Renegotiation round aborted");
                        }
                    }
                }
            }

            while rounds.join_next().await.is_some() {}
        });

        Self { handle }
    }

    /// Stop forwarding and abort rounds still in flight
    pub fn stop(self) {
        self.handle.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for RenegotiationCoordinator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SourceKind;

    fn senders(entries: &[(SenderSlot, &MediaTrack)]) -> BTreeMap<SenderSlot, TrackId> {
        entries.iter().map(|(slot, t)| (*slot, t.id())).collect()
    }

    #[test]
    fn test_initial_plan_adds_in_wire_order() {
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let mic = MediaTrack::new(SourceKind::Microphone, "mic");
        let comp = Composition::new(1, cam.clone(), None, Some(mic.clone()));

        let plan = plan_sender_changes(&BTreeMap::new(), &comp);
        assert_eq!(
            plan,
            vec![
                SenderChange::Add { slot: SenderSlot::PrimaryVideo, track: cam },
                SenderChange::Add { slot: SenderSlot::Audio, track: mic },
            ]
        );
    }

    #[test]
    fn test_unchanged_is_empty() {
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let comp = Composition::new(2, cam.clone(), None, None);

        let plan = plan_sender_changes(&senders(&[(SenderSlot::PrimaryVideo, &cam)]), &comp);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_screen_share_replaces_primary_and_adds_pip() {
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let mic = MediaTrack::new(SourceKind::Microphone, "mic");
        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        let mix = MediaTrack::new(SourceKind::Mix, "mix");

        let current = senders(&[(SenderSlot::PrimaryVideo, &cam), (SenderSlot::Audio, &mic)]);
        let comp = Composition::new(3, screen.clone(), Some(cam.clone()), Some(mix.clone()));

        let plan = plan_sender_changes(&current, &comp);
        assert_eq!(
            plan,
            vec![
                SenderChange::Replace { slot: SenderSlot::PrimaryVideo, track: screen },
                SenderChange::Add { slot: SenderSlot::SecondaryVideo, track: cam },
                SenderChange::Replace { slot: SenderSlot::Audio, track: mix },
            ]
        );
    }

    #[test]
    fn test_vacated_slots_removed() {
        let screen = MediaTrack::new(SourceKind::Screen, "screen");
        let cam = MediaTrack::new(SourceKind::Camera, "cam");
        let mix = MediaTrack::new(SourceKind::Mix, "mix");

        let current = senders(&[
            (SenderSlot::PrimaryVideo, &screen),
            (SenderSlot::SecondaryVideo, &cam),
            (SenderSlot::Audio, &mix),
        ]);
        let comp = Composition::new(4, cam.clone(), None, None);

        let plan = plan_sender_changes(&current, &comp);
        let slots: Vec<_> = plan.iter().map(SenderChange::slot).collect();
        assert_eq!(
            slots,
            vec![SenderSlot::PrimaryVideo, SenderSlot::SecondaryVideo, SenderSlot::Audio]
        );
        assert!(matches!(plan[1], SenderChange::Remove { .. }));
        assert!(matches!(plan[2], SenderChange::Remove { .. }));
    }
}
