//! Wire types shared by the huddle session server and endpoints.
//!
//! Everything on the wire is JSON with an internal `"type"` tag. Negotiation
//! payloads (offer/answer/candidate bodies) are opaque `serde_json::Value`s:
//! the server routes them verbatim and never inspects their contents.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Server-assigned identifier for one live endpoint connection.
///
/// Unique for the lifetime of the connection, never reused while it is live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh connection id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One member's roster entry within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub joined_at: i64,
}

impl MemberInfo {
    pub fn new(connection_id: ConnectionId, display_name: impl Into<String>) -> Self {
        Self {
            connection_id,
            display_name: display_name.into(),
            joined_at: Utc::now().timestamp(),
        }
    }
}

/// The three kinds of negotiation traffic the relay routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routed negotiation message: sender, target, opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: SignalKind,
    pub sender: ConnectionId,
    pub target: ConnectionId,
    pub payload: Value,
}

impl Envelope {
    pub fn new(
        kind: SignalKind,
        sender: ConnectionId,
        target: ConnectionId,
        payload: Value,
    ) -> Self {
        Self {
            kind,
            sender,
            target,
            payload,
        }
    }

    /// The server-to-target message delivering this envelope.
    pub fn into_delivery(self) -> ServerMessage {
        match self.kind {
            SignalKind::Offer => ServerMessage::Offer {
                from: self.sender,
                payload: self.payload,
            },
            SignalKind::Answer => ServerMessage::Answer {
                from: self.sender,
                payload: self.payload,
            },
            SignalKind::Candidate => ServerMessage::Candidate {
                from: self.sender,
                payload: self.payload,
            },
        }
    }
}

/// Messages sent from an endpoint to the session server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the session named in the connection URL.
    Join { display_name: String },
    /// Leave the session without closing the connection.
    Leave,
    /// Relay an offer to another member.
    Offer { to: ConnectionId, payload: Value },
    /// Relay an answer to another member.
    Answer { to: ConnectionId, payload: Value },
    /// Relay a network candidate to another member.
    Candidate { to: ConnectionId, payload: Value },
    /// Keepalive.
    Ping,
}

impl ClientMessage {
    /// Build the relay message for a signal addressed to `to`.
    pub fn signal(kind: SignalKind, to: ConnectionId, payload: Value) -> Self {
        match kind {
            SignalKind::Offer => ClientMessage::Offer { to, payload },
            SignalKind::Answer => ClientMessage::Answer { to, payload },
            SignalKind::Candidate => ClientMessage::Candidate { to, payload },
        }
    }
}

/// Messages sent from the session server to an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted: the assigned id plus the members already present.
    JoinSuccess {
        connection_id: ConnectionId,
        members: Vec<MemberInfo>,
    },
    /// Join rejected; the connection stays open and unjoined.
    JoinError { reason: String },
    /// Presence broadcast: a new member joined the session.
    MemberJoined { member: MemberInfo },
    /// Presence broadcast: a member left the session.
    MemberLeft {
        connection_id: ConnectionId,
        display_name: String,
    },
    /// Offer relayed from another member.
    Offer { from: ConnectionId, payload: Value },
    /// Answer relayed from another member.
    Answer { from: ConnectionId, payload: Value },
    /// Network candidate relayed from another member.
    Candidate { from: ConnectionId, payload: Value },
    /// Keepalive response.
    Pong,
    /// Non-fatal protocol error.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn client_join_wire_shape() {
        let msg = ClientMessage::Join {
            display_name: "ada".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"type": "join", "display_name": "ada"}));
    }

    #[test]
    fn signal_messages_tag_by_kind() {
        let to = ConnectionId::from("target-1");
        let msg = ClientMessage::signal(SignalKind::Candidate, to, json!({"candidate": "c0"}));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "candidate");
        assert_eq!(value["to"], "target-1");
        assert_eq!(value["payload"]["candidate"], "c0");
    }

    #[test]
    fn signal_kind_displays_as_its_wire_tag() {
        for kind in [SignalKind::Offer, SignalKind::Answer, SignalKind::Candidate] {
            let tag = serde_json::to_value(kind).unwrap();
            assert_eq!(tag, json!(kind.to_string()));
        }
    }

    #[test]
    fn envelope_payload_round_trips_verbatim() {
        let payload = json!({"sdp": "v=0\r\no=- 42 2 IN IP4 127.0.0.1", "nested": {"k": [1, 2, 3]}});
        let envelope = Envelope::new(
            SignalKind::Offer,
            ConnectionId::from("a"),
            ConnectionId::from("b"),
            payload.clone(),
        );
        let delivered = envelope.into_delivery();
        let text = serde_json::to_string(&delivered).unwrap();
        let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
        match parsed {
            ServerMessage::Offer { from, payload: p } => {
                assert_eq!(from, ConnectionId::from("a"));
                assert_eq!(p, payload);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn server_messages_parse_from_tagged_json() {
        let text = r#"{"type":"member_left","connection_id":"c9","display_name":"ada"}"#;
        let msg: ServerMessage = serde_json::from_str(text).unwrap();
        match msg {
            ServerMessage::MemberLeft {
                connection_id,
                display_name,
            } => {
                assert_eq!(connection_id, ConnectionId::from("c9"));
                assert_eq!(display_name, "ada");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
