//! Reconnecting signaling channel
//!
//! `connect` walks the candidate endpoints in order, each bounded by the
//! configured timeout; the first that accepts becomes the active endpoint
//! and is tried first on later passes.
//!
//! `send` never fails the caller: with a live link the message is written
//! immediately, otherwise it goes to the [`PendingQueue`]. When a link drops
//! unexpectedly exactly one reconnect pass is scheduled after a backoff delay.
//! A successful pass writes the announce message, then flushes the queue. A
//! failed pass moves the channel to [`ChannelState::Unavailable`] and nothing
//! is retried until `connect` is called again.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::ids::ViewerId;
use crate::stats::{ChannelCounters, ChannelStats};
use crate::task::{backoff, RetryTask};

use super::config::ChannelConfig;
use super::message::SignalingMessage;
use super::queue::{PendingQueue, QueueOutcome};
use super::transport::{Connector, Link};

/// Channel connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// `connect` has not been called
    Idle,
    /// First pass over the candidates in progress
    Connecting,
    /// Link up to `endpoint`
    Connected { endpoint: String },
    /// Link dropped; a reconnect pass is scheduled or running
    Reconnecting { attempt: u32 },
    /// Every candidate failed; waiting for an explicit `connect`
    Unavailable,
    /// Closed by the owner
    Closed,
}

impl ChannelState {
    /// Whether a link is up
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected { .. })
    }
}

/// Events emitted by the channel
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Connection state changed
    StateChanged(ChannelState),
    /// A message arrived
    Message(SignalingMessage),
}

/// What happened to a sent message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the live link
    Sent,
    /// Held until the next reconnect
    Queued,
    /// Channel is closed; message dropped
    Dropped,
}

struct ActiveLink {
    generation: u64,
    endpoint: String,
    outbound: mpsc::UnboundedSender<String>,
    since: Instant,
}

struct Core {
    candidates: Vec<String>,
    active_endpoint: Option<String>,
    link: Option<ActiveLink>,
    generation: u64,
    pending: PendingQueue,
    announce: Option<SignalingMessage>,
    reader: Option<JoinHandle<()>>,
    reconnect: RetryTask,
    /// Consecutive unexpected closes, drives the backoff
    drops: u32,
    closed: bool,
}

struct Inner {
    config: ChannelConfig,
    connector: Arc<dyn Connector>,
    core: Mutex<Core>,
    /// Serializes passes over the candidate list
    pass: tokio::sync::Mutex<()>,
    state: watch::Sender<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    counters: ChannelCounters,
}

/// Signaling channel handle (cheap to clone)
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<Inner>,
}

impl SignalingChannel {
    /// Create a channel.
    ///
    /// Returns the channel and a receiver for its events.
    pub fn new(
        config: ChannelConfig,
        connector: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Idle);

        let channel = Self {
            inner: Arc::new(Inner {
                config,
                connector,
                core: Mutex::new(Core {
                    candidates: Vec::new(),
                    active_endpoint: None,
                    link: None,
                    generation: 0,
                    pending: PendingQueue::new(),
                    announce: None,
                    reader: None,
                    reconnect: RetryTask::new(),
                    drops: 0,
                    closed: false,
                }),
                pass: tokio::sync::Mutex::new(()),
                state,
                events,
                counters: ChannelCounters::default(),
            }),
        };

        (channel, rx)
    }

    /// Connect using `endpoints` in order.
    ///
    /// Cancels any scheduled reconnect. Returns
    /// [`Error::TransportUnavailable`] if no endpoint accepted.
    pub async fn connect(&self, endpoints: Vec<String>) -> Result<()> {
        {
            let mut core = self.inner.core.lock();
            core.closed = false;
            core.reconnect.cancel();
            core.drops = 0;
            if core.candidates != endpoints {
                core.active_endpoint = None;
                core.candidates = endpoints;
            }
            if core.link.is_some() {
                return Ok(());
            }
        }

        self.set_state(ChannelState::Connecting);
        self.run_pass().await
    }

    /// Send a message, queueing it if no link is up
    pub fn send(&self, message: SignalingMessage) -> SendOutcome {
        let mut lost = None;
        let outcome = {
            let mut core = self.inner.core.lock();
            if core.closed {
                tracing::debug!(kind = message.kind(), "Channel closed, dropping message");
                return SendOutcome::Dropped;
            }

            if let Some(link) = core.link.as_ref() {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(kind = message.kind(), error = %e, "Failed to encode message");
                        return SendOutcome::Dropped;
                    }
                };
                if link.outbound.send(text).is_ok() {
                    ChannelCounters::add(&self.inner.counters.sent, 1);
                    return SendOutcome::Sent;
                }
                lost = Some(link.generation);
            }

            tracing::debug!(kind = message.kind(), viewer = ?message.viewer_id(), "Queueing message");
            if core.pending.push(message) == QueueOutcome::ReplacedOffer {
                ChannelCounters::add(&self.inner.counters.replaced, 1);
            }
            ChannelCounters::add(&self.inner.counters.queued, 1);
            SendOutcome::Queued
        };

        if let Some(generation) = lost {
            self.link_lost(generation, "write failed");
        }
        outcome
    }

    /// Set the message written first on every successful connect
    pub fn set_announce(&self, message: Option<SignalingMessage>) {
        self.inner.core.lock().announce = message;
    }

    /// Drop everything queued for a viewer
    pub fn discard_pending(&self, viewer: &ViewerId) -> usize {
        let discarded = self.inner.core.lock().pending.discard(viewer);
        if discarded > 0 {
            ChannelCounters::add(&self.inner.counters.discarded, discarded as u64);
            tracing::debug!(viewer = %viewer, discarded, "Discarded queued messages");
        }
        discarded
    }

    /// Number of queued messages
    pub fn pending_len(&self) -> usize {
        self.inner.core.lock().pending.len()
    }

    /// Number of messages queued for one viewer
    pub fn pending_for(&self, viewer: &ViewerId) -> usize {
        self.inner.core.lock().pending.len_for(viewer)
    }

    /// Current state
    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    /// Watch state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Endpoint remembered from the last successful connect
    pub fn active_endpoint(&self) -> Option<String> {
        self.inner.core.lock().active_endpoint.clone()
    }

    /// Channel statistics
    pub fn stats(&self) -> ChannelStats {
        self.inner.counters.snapshot()
    }

    /// Close the channel: cancel reconnects, drop the link and the queue.
    ///
    /// Safe to call more than once.
    pub fn close(&self) {
        let reader = {
            let mut core = self.inner.core.lock();
            core.closed = true;
            core.reconnect.cancel();
            core.link = None;
            core.pending.clear();
            core.reader.take()
        };

        if let Some(reader) = reader {
            reader.abort();
        }
        self.set_state(ChannelState::Closed);
    }

    /// One pass over the candidate list
    async fn run_pass(&self) -> Result<()> {
        let _pass = self.inner.pass.lock().await;

        let endpoints = {
            let core = self.inner.core.lock();
            if core.closed {
                return Err(Error::TransportInterrupted("channel closed".into()));
            }
            if core.link.is_some() {
                return Ok(());
            }
            ordered_candidates(&core.candidates, core.active_endpoint.as_deref())
        };

        for endpoint in &endpoints {
            let attempt = tokio::time::timeout(
                self.inner.config.connect_timeout,
                self.inner.connector.connect(endpoint),
            )
            .await;

            match attempt {
                Ok(Ok(link)) => {
                    if self.install(endpoint, link) {
                        return Ok(());
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(endpoint = %endpoint, error = %e, "Signaling endpoint failed");
                }
                Err(_) => {
                    tracing::warn!(
                        endpoint = %endpoint,
                        timeout_ms = self.inner.config.connect_timeout.as_millis() as u64,
                        "Signaling endpoint timed out"
                    );
                }
            }

            if self.inner.core.lock().closed {
                return Err(Error::TransportInterrupted("channel closed".into()));
            }
        }

        tracing::error!(attempted = endpoints.len(), "All signaling endpoints failed");
        self.set_state(ChannelState::Unavailable);
        Err(Error::TransportUnavailable {
            attempted: endpoints.len(),
        })
    }

    /// Adopt a fresh link: announce, flush the queue, start reading
    fn install(&self, endpoint: &str, link: Link) -> bool {
        let Link {
            outbound,
            mut inbound,
        } = link;

        let mut core = self.inner.core.lock();
        if core.closed {
            return false;
        }

        if let Some(announce) = core.announce.as_ref() {
            match announce.to_json() {
                Ok(text) => {
                    if outbound.send(text).is_err() {
                        tracing::warn!(endpoint = %endpoint, "Link closed before announce");
                        return false;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Failed to encode announce"),
            }
        }

        let queued = core.pending.drain();
        let total = queued.len();
        let mut queued = queued.into_iter();
        let mut flushed = 0;
        while let Some(message) = queued.next() {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(kind = message.kind(), error = %e, "Failed to encode queued message");
                    continue;
                }
            };
            if outbound.send(text).is_err() {
                // Link died mid-flush; keep the rest (and this one) for the next link
                core.pending.push(message);
                for rest in queued.by_ref() {
                    core.pending.push(rest);
                }
                tracing::warn!(endpoint = %endpoint, flushed, total, "Link closed during flush");
                return false;
            }
            flushed += 1;
        }
        ChannelCounters::add(&self.inner.counters.flushed, flushed as u64);

        core.generation += 1;
        let generation = core.generation;
        core.link = Some(ActiveLink {
            generation,
            endpoint: endpoint.to_string(),
            outbound,
            since: Instant::now(),
        });
        core.active_endpoint = Some(endpoint.to_string());

        let channel = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                channel.dispatch(&text);
            }
            channel.link_lost(generation, "closed by peer");
        });
        if let Some(old) = core.reader.replace(reader) {
            old.abort();
        }
        drop(core);

        tracing::info!(endpoint = %endpoint, generation, flushed, "Signaling connected");
        self.set_state(ChannelState::Connected {
            endpoint: endpoint.to_string(),
        });
        true
    }

    fn dispatch(&self, text: &str) {
        match SignalingMessage::from_json(text) {
            Ok(message) => {
                tracing::trace!(kind = message.kind(), "Signaling message received");
                let _ = self.inner.events.send(ChannelEvent::Message(message));
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed signaling message");
            }
        }
    }

    /// Handle the loss of link `generation`; stale generations are ignored
    fn link_lost(&self, generation: u64, reason: &str) {
        let attempt = {
            let mut core = self.inner.core.lock();
            let (lifetime, endpoint) = match core.link.as_ref() {
                Some(link) if link.generation == generation => {
                    (link.since.elapsed(), link.endpoint.clone())
                }
                _ => return,
            };
            core.link = None;
            if core.closed {
                return;
            }

            if lifetime >= self.inner.config.stable_link_threshold {
                core.drops = 0;
            }
            core.drops += 1;
            let attempt = core.drops;
            let delay = backoff(
                self.inner.config.reconnect_base_delay,
                self.inner.config.reconnect_max_delay,
                attempt,
            );

            let channel = self.clone();
            if core
                .reconnect
                .schedule(delay, async move { channel.reconnect().await })
            {
                ChannelCounters::add(&self.inner.counters.reconnects, 1);
            }

            tracing::warn!(
                endpoint = %endpoint,
                reason,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Signaling link lost, reconnect scheduled"
            );
            attempt
        };

        self.set_state(ChannelState::Reconnecting { attempt });
    }

    async fn reconnect(&self) {
        {
            let mut core = self.inner.core.lock();
            // Running now; a later close must not abort us mid-pass
            core.reconnect.disarm();
            if core.closed {
                return;
            }
        }

        if let Err(e) = self.run_pass().await {
            tracing::warn!(error = %e, "Reconnect pass failed");
        }
    }

    fn set_state(&self, state: ChannelState) {
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });

        if changed {
            let _ = self.inner.events.send(ChannelEvent::StateChanged(state));
        }
    }
}

/// Candidates in order, with the remembered endpoint moved to the front
fn ordered_candidates(candidates: &[String], active: Option<&str>) -> Vec<String> {
    let mut ordered = Vec::with_capacity(candidates.len());
    if let Some(active) = active {
        if candidates.iter().any(|c| c == active) {
            ordered.push(active.to_string());
        }
    }
    ordered.extend(
        candidates
            .iter()
            .filter(|c| Some(c.as_str()) != active)
            .cloned(),
    );
    ordered
}
