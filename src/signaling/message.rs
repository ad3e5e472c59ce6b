//! Signaling message types
//!
//! Messages are JSON objects discriminated by a `type` field:
//!
//! ```text
//! {"type":"broadcaster_join","broadcasterId":"b1","userInfo":{...}}
//! {"type":"stream_start","broadcasterId":"b1","title":"hi","requestViewers":true}
//! {"type":"offer","broadcasterId":"b1","viewerId":"v1","offer":{"type":"offer","sdp":"..."}}
//! {"type":"ice_candidate","broadcasterId":"b1","viewerId":"v1","candidate":{...}}
//! {"type":"online_viewers","viewers":["v1","v2"]}
//! ```
//!
//! Session descriptions and ICE candidates are opaque to this crate; they are
//! carried verbatim between the media stack and the signaling server.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{BroadcasterId, ViewerId};

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description (opaque negotiation payload)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate (opaque reachability descriptor)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Create a candidate without mid/line index
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// A message exchanged over the signaling channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Producer announces itself (sent on every connect)
    #[serde(rename_all = "camelCase")]
    BroadcasterJoin {
        broadcaster_id: BroadcasterId,
        #[serde(default)]
        user_info: serde_json::Value,
    },

    /// Broadcast went live
    #[serde(rename_all = "camelCase")]
    StreamStart {
        broadcaster_id: BroadcasterId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default)]
        request_viewers: bool,
    },

    /// Broadcast ended
    #[serde(rename_all = "camelCase")]
    StreamEnd { broadcaster_id: BroadcasterId },

    /// Negotiation offer for one viewer
    #[serde(rename_all = "camelCase")]
    Offer {
        broadcaster_id: BroadcasterId,
        viewer_id: ViewerId,
        offer: SessionDescription,
    },

    /// Viewer's answer to an offer
    #[serde(rename_all = "camelCase")]
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        broadcaster_id: Option<BroadcasterId>,
        viewer_id: ViewerId,
        answer: SessionDescription,
    },

    /// ICE candidate in either direction
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        broadcaster_id: Option<BroadcasterId>,
        viewer_id: ViewerId,
        candidate: IceCandidate,
    },

    /// A viewer wants to watch
    #[serde(rename_all = "camelCase")]
    ViewerJoin { viewer_id: ViewerId },

    /// A viewer went away
    #[serde(rename_all = "camelCase")]
    ViewerLeave { viewer_id: ViewerId },

    /// Full list of viewers currently online
    OnlineViewers { viewers: Vec<ViewerId> },

    /// Viewers that have no working session with this producer
    ViewersNeedConnection { viewers: Vec<ViewerId> },
}

impl SignalingMessage {
    /// Decode a message from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode this message as JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// The wire `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::BroadcasterJoin { .. } => "broadcaster_join",
            SignalingMessage::StreamStart { .. } => "stream_start",
            SignalingMessage::StreamEnd { .. } => "stream_end",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
            SignalingMessage::ViewerJoin { .. } => "viewer_join",
            SignalingMessage::ViewerLeave { .. } => "viewer_leave",
            SignalingMessage::OnlineViewers { .. } => "online_viewers",
            SignalingMessage::ViewersNeedConnection { .. } => "viewers_need_connection",
        }
    }

    /// The viewer this message is addressed to or about, if exactly one
    pub fn viewer_id(&self) -> Option<&ViewerId> {
        match self {
            SignalingMessage::Offer { viewer_id, .. }
            | SignalingMessage::Answer { viewer_id, .. }
            | SignalingMessage::IceCandidate { viewer_id, .. }
            | SignalingMessage::ViewerJoin { viewer_id }
            | SignalingMessage::ViewerLeave { viewer_id } => Some(viewer_id),
            _ => None,
        }
    }
}
