//! Statistics and metrics

pub mod metrics;

pub use metrics::{BroadcastStats, ChannelStats, SessionInfo};
pub(crate) use metrics::ChannelCounters;
