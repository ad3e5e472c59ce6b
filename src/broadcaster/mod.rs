//! Broadcaster
//!
//! Producer-side API for:
//! - Previewing local capture before going live
//! - Announcing to a signaling server and surviving reconnects
//! - Broadcasting one composition to many viewers

pub mod config;
pub mod observer;
pub mod publisher;

pub use config::BroadcasterConfig;
pub use observer::StreamObserver;
pub use publisher::{Broadcaster, Collaborators};
