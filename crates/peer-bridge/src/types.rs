//! Core types for peer coordination messages

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation token pairing a forwarded request with its response or stream
pub type RequestId = String;

/// Server-side session identifier
pub type SessionId = String;

/// Unique identifier of one peer process, stable for its lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a fresh random peer id
    pub fn generate() -> Self {
        Self(format!("{:016x}", rand::random::<u64>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A channel inside a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelKey {
    pub session_id: SessionId,
    pub channel: String,
}

impl ChannelKey {
    pub fn new(session_id: impl Into<SessionId>, channel: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            channel: channel.into(),
        }
    }
}

/// An event emitted by the server for a session (or a channel of a session)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportEvent {
    /// Session the event belongs to
    pub session_id: SessionId,
    /// Channel name for channel events, `None` for session events
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Event kind as reported by the server
    pub kind: String,
    /// Opaque event body
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TransportEvent {
    /// Create a session-scoped event
    pub fn session(
        session_id: impl Into<SessionId>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            channel: None,
            kind: kind.into(),
            payload,
        }
    }

    /// Create a channel-scoped event
    pub fn channel(key: ChannelKey, kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            session_id: key.session_id,
            channel: Some(key.channel),
            kind: kind.into(),
            payload,
        }
    }
}

/// Message kinds exchanged between peers of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum BridgeMessage {
    /// Follower probing for a leader with a ready connection
    #[serde(rename = "ping:leader")]
    PingLeader,

    /// Ready leader answering a probe
    #[serde(rename = "pong:leader")]
    PongLeader,

    /// New leader soliciting every peer's subscriptions
    #[serde(rename = "leader:collecting_subscriptions")]
    CollectingSubscriptions,

    /// A peer's answer to a subscription solicitation
    #[serde(rename = "subscriptions:announce")]
    SubscriptionsAnnounce {
        sessions: Vec<SessionId>,
        channels: Vec<ChannelKey>,
    },

    /// Leader finished its handover and accepts requests
    #[serde(rename = "leader:transport_ready")]
    TransportReady { connection_id: String },

    /// Fallback election: candidacy with its claim time
    #[serde(rename = "leader:claim")]
    LeaderClaim { claimed_at: i64 },

    /// Fallback election: leader liveness assertion
    #[serde(rename = "leader:heartbeat")]
    LeaderHeartbeat { claimed_at: i64 },

    /// Fallback election: leader stepping down
    #[serde(rename = "leader:resign")]
    LeaderResign,

    /// Server event relayed by the leader
    #[serde(rename = "event")]
    Event { event: TransportEvent },

    /// One event of a forwarded `send`
    #[serde(rename = "stream:event")]
    StreamEvent {
        request_id: RequestId,
        event: TransportEvent,
    },

    /// Forwarded `send` completed
    #[serde(rename = "stream:end")]
    StreamEnd { request_id: RequestId },

    /// Forwarded `send` failed
    #[serde(rename = "stream:error")]
    StreamError { request_id: RequestId, error: String },

    /// Outcome of a forwarded non-streaming request
    #[serde(rename = "response")]
    Response {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "request:send")]
    SendRequest {
        request_id: RequestId,
        session_id: SessionId,
        input: serde_json::Value,
    },

    #[serde(rename = "request:subscribe")]
    SubscribeRequest {
        request_id: RequestId,
        session_id: SessionId,
    },

    #[serde(rename = "request:unsubscribe")]
    UnsubscribeRequest {
        request_id: RequestId,
        session_id: SessionId,
    },

    #[serde(rename = "request:abort")]
    AbortRequest {
        request_id: RequestId,
        session_id: SessionId,
    },

    #[serde(rename = "request:close")]
    CloseRequest {
        request_id: RequestId,
        session_id: SessionId,
    },

    #[serde(rename = "request:submit_tool_result")]
    SubmitToolResultRequest {
        request_id: RequestId,
        session_id: SessionId,
        tool_call_id: String,
        result: serde_json::Value,
    },

    #[serde(rename = "request:channel_subscribe")]
    ChannelSubscribeRequest {
        request_id: RequestId,
        session_id: SessionId,
        channel: String,
    },

    #[serde(rename = "request:channel_publish")]
    ChannelPublishRequest {
        request_id: RequestId,
        session_id: SessionId,
        channel: String,
        payload: serde_json::Value,
    },
}

impl BridgeMessage {
    /// Wire name of this message kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PingLeader => "ping:leader",
            Self::PongLeader => "pong:leader",
            Self::CollectingSubscriptions => "leader:collecting_subscriptions",
            Self::SubscriptionsAnnounce { .. } => "subscriptions:announce",
            Self::TransportReady { .. } => "leader:transport_ready",
            Self::LeaderClaim { .. } => "leader:claim",
            Self::LeaderHeartbeat { .. } => "leader:heartbeat",
            Self::LeaderResign => "leader:resign",
            Self::Event { .. } => "event",
            Self::StreamEvent { .. } => "stream:event",
            Self::StreamEnd { .. } => "stream:end",
            Self::StreamError { .. } => "stream:error",
            Self::Response { .. } => "response",
            Self::SendRequest { .. } => "request:send",
            Self::SubscribeRequest { .. } => "request:subscribe",
            Self::UnsubscribeRequest { .. } => "request:unsubscribe",
            Self::AbortRequest { .. } => "request:abort",
            Self::CloseRequest { .. } => "request:close",
            Self::SubmitToolResultRequest { .. } => "request:submit_tool_result",
            Self::ChannelSubscribeRequest { .. } => "request:channel_subscribe",
            Self::ChannelPublishRequest { .. } => "request:channel_publish",
        }
    }

    /// Correlation id carried by request, response and stream messages
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::StreamEvent { request_id, .. }
            | Self::StreamEnd { request_id }
            | Self::StreamError { request_id, .. }
            | Self::Response { request_id, .. }
            | Self::SendRequest { request_id, .. }
            | Self::SubscribeRequest { request_id, .. }
            | Self::UnsubscribeRequest { request_id, .. }
            | Self::AbortRequest { request_id, .. }
            | Self::CloseRequest { request_id, .. }
            | Self::SubmitToolResultRequest { request_id, .. }
            | Self::ChannelSubscribeRequest { request_id, .. }
            | Self::ChannelPublishRequest { request_id, .. } => Some(request_id),
            _ => None,
        }
    }
}

/// A message stamped with the peer that sent it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeFrame {
    pub peer_id: PeerId,
    pub message: BridgeMessage,
}

impl BridgeFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_kind_matches_serialized_tag() {
        let messages = vec![
            BridgeMessage::PingLeader,
            BridgeMessage::CollectingSubscriptions,
            BridgeMessage::TransportReady {
                connection_id: "conn-1".to_string(),
            },
            BridgeMessage::StreamEnd {
                request_id: "r1".to_string(),
            },
            BridgeMessage::ChannelPublishRequest {
                request_id: "r2".to_string(),
                session_id: "s1".to_string(),
                channel: "presence".to_string(),
                payload: json!({"x": 1}),
            },
        ];

        for message in messages {
            let value = serde_json::to_value(&message).unwrap();
            assert_eq!(value["type"], message.kind());
        }
    }

    #[test]
    fn test_request_fields_are_camel_case() {
        let frame = BridgeFrame {
            peer_id: PeerId::from("peer-a"),
            message: BridgeMessage::SubmitToolResultRequest {
                request_id: "r9".to_string(),
                session_id: "s1".to_string(),
                tool_call_id: "call-1".to_string(),
                result: json!("ok"),
            },
        };

        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["peerId"], "peer-a");
        assert_eq!(value["message"]["requestId"], "r9");
        assert_eq!(value["message"]["toolCallId"], "call-1");

        let decoded = BridgeFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_request_id_extraction() {
        let request = BridgeMessage::CloseRequest {
            request_id: "r1".to_string(),
            session_id: "s1".to_string(),
        };
        assert_eq!(request.request_id().map(String::as_str), Some("r1"));

        assert!(BridgeMessage::PongLeader.request_id().is_none());
    }

    #[test]
    fn test_generated_peer_ids_differ() {
        assert_ne!(PeerId::generate(), PeerId::generate());
    }
}
