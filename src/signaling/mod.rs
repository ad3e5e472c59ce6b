//! Signaling
//!
//! The signaling channel carries negotiation metadata (offers, answers, ICE
//! candidates) and viewer presence between the broadcaster and the signaling
//! server. It is distinct from the media path it helps set up.
//!
//! # Reconnection
//!
//! ```text
//!   connect([a, b, c])
//!        │  try each endpoint, per-candidate timeout
//!        ▼
//!   Connected(b) ── unexpected close ──► Reconnecting ── backoff ──► one pass
//!        ▲                                                           │
//!        └──────── success: announce, flush queue in FIFO order ◄────┤
//!                                                                    │
//!                            every endpoint failed: Unavailable ◄────┘
//! ```
//!
//! Sending never fails the caller: without a link, messages go to the
//! [`PendingQueue`] and are flushed after the next successful connect.

pub mod channel;
pub mod config;
pub mod message;
pub mod queue;
pub mod transport;

pub use channel::{ChannelEvent, ChannelState, SendOutcome, SignalingChannel};
pub use config::ChannelConfig;
pub use message::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
pub use queue::{PendingQueue, QueueOutcome};
pub use transport::{Connector, Link, TcpConnector};
