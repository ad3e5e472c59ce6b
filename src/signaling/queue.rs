//! Outbound messages held back while the channel is down
//!
//! Per viewer the queue keeps at most one offer (a newer offer supersedes an
//! older undelivered one) and every ICE candidate in emission order. Messages
//! not addressed to a viewer go to a control FIFO. On flush, control messages
//! come first, then each viewer's offer followed by its candidates, viewers in
//! the order they were first queued.

use std::collections::{HashMap, VecDeque};

use crate::ids::ViewerId;

use super::message::SignalingMessage;

/// Result of queueing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Message was appended
    Queued,
    /// Message was an offer and replaced an undelivered older offer
    ReplacedOffer,
}

#[derive(Debug, Default)]
struct ViewerQueue {
    offer: Option<SignalingMessage>,
    candidates: Vec<SignalingMessage>,
}

impl ViewerQueue {
    fn len(&self) -> usize {
        self.offer.is_some() as usize + self.candidates.len()
    }
}

/// Pending outbound messages, keyed by viewer
#[derive(Debug, Default)]
pub struct PendingQueue {
    control: VecDeque<SignalingMessage>,
    viewers: HashMap<ViewerId, ViewerQueue>,
    /// First-queued order of viewers, for deterministic flushing
    order: Vec<ViewerId>,
}

impl PendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message
    pub fn push(&mut self, message: SignalingMessage) -> QueueOutcome {
        let viewer = match &message {
            SignalingMessage::Offer { viewer_id, .. }
            | SignalingMessage::IceCandidate { viewer_id, .. } => viewer_id.clone(),
            _ => {
                self.control.push_back(message);
                return QueueOutcome::Queued;
            }
        };

        if !self.viewers.contains_key(&viewer) {
            self.order.push(viewer.clone());
        }
        let entry = self.viewers.entry(viewer).or_default();

        if matches!(message, SignalingMessage::Offer { .. }) {
            if entry.offer.replace(message).is_some() {
                return QueueOutcome::ReplacedOffer;
            }
        } else {
            entry.candidates.push(message);
        }

        QueueOutcome::Queued
    }

    /// Drop everything queued for a viewer, returning how many messages were discarded
    pub fn discard(&mut self, viewer: &ViewerId) -> usize {
        match self.viewers.remove(viewer) {
            Some(queue) => {
                self.order.retain(|v| v != viewer);
                queue.len()
            }
            None => 0,
        }
    }

    /// Take every queued message in flush order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<SignalingMessage> {
        let mut out: Vec<SignalingMessage> = self.control.drain(..).collect();

        for viewer in self.order.drain(..) {
            if let Some(queue) = self.viewers.remove(&viewer) {
                out.extend(queue.offer);
                out.extend(queue.candidates);
            }
        }

        out
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.control.clear();
        self.viewers.clear();
        self.order.clear();
    }

    /// Total number of queued messages
    pub fn len(&self) -> usize {
        self.control.len() + self.viewers.values().map(ViewerQueue::len).sum::<usize>()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of messages queued for one viewer
    pub fn len_for(&self, viewer: &ViewerId) -> usize {
        self.viewers.get(viewer).map_or(0, ViewerQueue::len)
    }

    /// Whether an offer is queued for a viewer
    pub fn has_offer(&self, viewer: &ViewerId) -> bool {
        self.viewers.get(viewer).is_some_and(|q| q.offer.is_some())
    }
}
