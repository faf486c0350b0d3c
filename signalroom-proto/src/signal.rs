//! Signaling message types shared by the relay server and its clients.
//!
//! Every frame on the wire is a JSON object with a `type` field. The relay
//! only reads `type` and `room`; all other fields are opaque session
//! negotiation data owned by the peer-connection layer and are carried in
//! [`Signal::payload`] untouched.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `type` discriminator of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Client asks to enter a room.
    Join,
    /// Session description offer, forwarded to the other room members.
    Offer,
    /// Session description answer, forwarded to the other room members.
    Answer,
    /// Connectivity candidate, forwarded to the other room members.
    IceCandidate,
    /// Client leaves its room.
    Leave,
    /// Server tells existing members that someone new joined.
    Ready,
    /// Server tells remaining members that someone left.
    PeerLeft,
}

impl SignalKind {
    /// Wire name of this kind, as it appears in the `type` field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::Leave => "leave",
            Self::Ready => "ready",
            Self::PeerLeft => "peer-left",
        }
    }

    /// Whether a client may send this kind to the relay.
    #[must_use]
    pub const fn is_client_message(self) -> bool {
        matches!(
            self,
            Self::Join | Self::Offer | Self::Answer | Self::IceCandidate | Self::Leave
        )
    }

    /// Whether the relay may send this kind to a client.
    #[must_use]
    pub const fn is_server_message(self) -> bool {
        matches!(
            self,
            Self::Ready | Self::Offer | Self::Answer | Self::IceCandidate | Self::PeerLeft
        )
    }

    /// Offer, answer and candidate messages: the ones the relay forwards.
    #[must_use]
    pub const fn is_negotiation(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single signaling message.
///
/// `room` is optional on the wire: `join` requires it (enforced by
/// [`crate::codec::decode`]), the negotiation messages carry it for the
/// receiving client's benefit, and the server notices omit it. A `room`
/// that is not a string decodes as `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// The `type` field.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// The `room` field, if present.
    #[serde(
        default,
        deserialize_with = "room_if_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub room: Option<String>,
    /// Every other field, in the order it was received.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Reads `room` as any JSON value and keeps it only if it is a string.
///
/// Negotiation messages are routed by the sender's joined room, never by
/// this field.
fn room_if_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(room) => Ok(Some(room)),
        _ => Ok(None),
    }
}

impl Signal {
    /// Creates a message with no room and no payload.
    #[must_use]
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            room: None,
            payload: Map::new(),
        }
    }

    /// Sets the `room` field.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Adds an opaque payload field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// `{"type":"join","room":...}`
    #[must_use]
    pub fn join(room: impl Into<String>) -> Self {
        Self::new(SignalKind::Join).with_room(room)
    }

    /// `{"type":"leave","room":...}`
    #[must_use]
    pub fn leave(room: impl Into<String>) -> Self {
        Self::new(SignalKind::Leave).with_room(room)
    }

    /// An offer carrying a session description under the `offer` key.
    #[must_use]
    pub fn offer(room: impl Into<String>, description: Value) -> Self {
        Self::new(SignalKind::Offer)
            .with_field("offer", description)
            .with_room(room)
    }

    /// An answer carrying a session description under the `answer` key.
    #[must_use]
    pub fn answer(room: impl Into<String>, description: Value) -> Self {
        Self::new(SignalKind::Answer)
            .with_field("answer", description)
            .with_room(room)
    }

    /// A connectivity candidate under the `candidate` key.
    #[must_use]
    pub fn ice_candidate(room: impl Into<String>, candidate: Value) -> Self {
        Self::new(SignalKind::IceCandidate)
            .with_field("candidate", candidate)
            .with_room(room)
    }

    /// `{"type":"ready"}`
    #[must_use]
    pub fn ready() -> Self {
        Self::new(SignalKind::Ready)
    }

    /// `{"type":"peer-left"}`
    #[must_use]
    pub fn peer_left() -> Self {
        Self::new(SignalKind::PeerLeft)
    }

    /// The negotiation body conventionally carried by this kind of message:
    /// `offer`, `answer` or `candidate`. `None` for other kinds or when the
    /// sender used a different field layout.
    #[must_use]
    pub fn body(&self) -> Option<&Value> {
        let key = match self.kind {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::IceCandidate => "candidate",
            _ => return None,
        };
        self.payload.get(key)
    }
}
