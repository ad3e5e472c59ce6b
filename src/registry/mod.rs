//! Viewer session registry
//!
//! The registry owns one [`ConsumerSession`](crate::session::ConsumerSession)
//! per viewer and is the only place their state changes.
//!
//! # Architecture
//!
//! ```text
//!                          Arc<SessionRegistry>
//!                     ┌──────────────────────────┐
//!                     │ sessions: HashMap<Viewer,│
//!                     │   Mutex<ConsumerSession {│
//!                     │     peer, senders,       │
//!                     │     timer, ...           │
//!                     │   }>                     │
//!                     │ >                        │
//!                     │ composition (latest)     │
//!                     └────────────┬─────────────┘
//!                                  │
//!        ┌─────────────────────────┼─────────────────────────┐
//!        │                         │                         │
//!        ▼                         ▼                         ▼
//!   ensure(viewer)      broadcast_composition()      handle_peer_event()
//!   new transport,      per-session sync, run        connected/disconnected,
//!   first offer         concurrently                 recovery window, rebuild
//! ```
//!
//! # Failure containment
//!
//! A failing session is rebuilt on its own after a cooldown (doubling per
//! attempt, bounded by [`RegistryConfig::max_rebuild_attempts`]); other
//! sessions never see it. Every timer lives on its session and is cancelled
//! when the session is rebuilt or closed.

pub mod config;
pub mod error;
pub mod store;

pub use config::RegistryConfig;
pub use error::RegistryError;
pub use store::{RegistryEvents, SessionEvent, SessionRegistry};
