use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier handed to a connection when it is accepted.
///
/// Never reused: a client that reconnects is issued a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

pub type RoomId = String;

/// The three negotiation messages the relay knows how to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "ice-candidate" => Some(Self::IceCandidate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One signaling message plus its routing metadata.
///
/// `payload` is kept as the raw JSON text the sender produced so that it is
/// re-emitted verbatim.
#[derive(Debug, Clone)]
pub struct SignalingEnvelope {
    pub kind: SignalKind,
    pub target: Option<String>,
    pub payload: Option<Box<RawValue>>,
}

/// A decoded inbound frame.
#[derive(Debug)]
pub enum Inbound {
    Signal(SignalingEnvelope),
    Ping,
    /// Well-formed frame whose `type` the relay does not route.
    Unrecognized(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid message format: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is missing a string `type` field")]
    MissingType,
    #[error("binary frame is not valid UTF-8")]
    NotUtf8,
}

#[derive(Deserialize)]
struct WireFrame<'a> {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(rename = "socketId", default)]
    socket_id: Option<String>,
    #[serde(borrow, default, deserialize_with = "present_raw")]
    offer: Option<&'a RawValue>,
    #[serde(borrow, default, deserialize_with = "present_raw")]
    answer: Option<&'a RawValue>,
    #[serde(borrow, default, deserialize_with = "present_raw")]
    candidate: Option<&'a RawValue>,
}

/// A payload key that is present is kept as written, `null` included. Only an
/// absent key becomes `None`.
fn present_raw<'de: 'a, 'a, D>(deserializer: D) -> Result<Option<&'a RawValue>, D::Error>
where
    D: Deserializer<'de>,
{
    <&'a RawValue>::deserialize(deserializer).map(Some)
}

/// Decode one text frame received from a client.
pub fn decode_frame(text: &str) -> Result<Inbound, FrameError> {
    let frame: WireFrame<'_> = serde_json::from_str(text)?;
    let kind = frame.kind.ok_or(FrameError::MissingType)?;

    if kind == "ping" {
        return Ok(Inbound::Ping);
    }

    let Some(signal) = SignalKind::parse(&kind) else {
        return Ok(Inbound::Unrecognized(kind));
    };

    let payload = match signal {
        SignalKind::Offer => frame.offer,
        SignalKind::Answer => frame.answer,
        SignalKind::IceCandidate => frame.candidate,
    };

    Ok(Inbound::Signal(SignalingEnvelope {
        kind: signal,
        target: frame.socket_id,
        payload: payload.map(ToOwned::to_owned),
    }))
}

/// Decode a binary frame; some clients send JSON as binary.
pub fn decode_binary_frame(data: &[u8]) -> Result<Inbound, FrameError> {
    let text = std::str::from_utf8(data).map_err(|_| FrameError::NotUtf8)?;
    decode_frame(text)
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// First frame on every connection; tells the client its own id.
    Welcome {
        id: ConnectionId,
        room: Option<RoomId>,
    },
    Offer {
        #[serde(rename = "fromId")]
        from_id: ConnectionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        offer: Option<Box<RawValue>>,
    },
    Answer {
        #[serde(rename = "fromId")]
        from_id: ConnectionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        answer: Option<Box<RawValue>>,
    },
    IceCandidate {
        #[serde(rename = "fromId")]
        from_id: ConnectionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        candidate: Option<Box<RawValue>>,
    },
    /// A peer this connection was negotiating with has gone away.
    PeerDisconnected {
        #[serde(rename = "fromId")]
        from_id: ConnectionId,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn signal(from_id: ConnectionId, envelope: SignalingEnvelope) -> Self {
        match envelope.kind {
            SignalKind::Offer => Self::Offer {
                from_id,
                offer: envelope.payload,
            },
            SignalKind::Answer => Self::Answer {
                from_id,
                answer: envelope.payload,
            },
            SignalKind::IceCandidate => Self::IceCandidate {
                from_id,
                candidate: envelope.payload,
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
