//! Broadcaster configuration

use crate::ids::BroadcasterId;
use crate::registry::RegistryConfig;
use crate::signaling::ChannelConfig;

/// Broadcaster configuration options
#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Producer id stamped on every outgoing message
    pub broadcaster_id: BroadcasterId,

    /// Free-form profile sent with the join announcement
    pub user_info: serde_json::Value,

    /// Signaling endpoints, tried in order
    pub endpoints: Vec<String>,

    /// Camera device to open at preview (`None` = default device)
    pub camera_device: Option<String>,

    /// Microphone device to open at preview (`None` = default device)
    pub microphone_device: Option<String>,

    /// Signaling channel options
    pub channel: ChannelConfig,

    /// Session registry options
    pub registry: RegistryConfig,
}

impl BroadcasterConfig {
    /// Create a config for `broadcaster_id` with default options and no endpoints
    pub fn new(broadcaster_id: impl Into<String>) -> Self {
        Self {
            broadcaster_id: BroadcasterId::new(broadcaster_id),
            user_info: serde_json::Value::Null,
            endpoints: Vec::new(),
            camera_device: None,
            microphone_device: None,
            channel: ChannelConfig::default(),
            registry: RegistryConfig::default(),
        }
    }

    /// Append a signaling endpoint
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Set the profile sent with the join announcement
    pub fn user_info(mut self, info: serde_json::Value) -> Self {
        self.user_info = info;
        self
    }

    /// Set the camera device opened at preview
    pub fn camera_device(mut self, device: impl Into<String>) -> Self {
        self.camera_device = Some(device.into());
        self
    }

    /// Set the microphone device opened at preview
    pub fn microphone_device(mut self, device: impl Into<String>) -> Self {
        self.microphone_device = Some(device.into());
        self
    }

    /// Set signaling channel options
    pub fn channel(mut self, config: ChannelConfig) -> Self {
        self.channel = config;
        self
    }

    /// Set session registry options
    pub fn registry(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }
}
