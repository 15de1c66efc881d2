// ================
// common/src/lib.rs
// ================
//! Wire types shared between the duet recording server and its browser clients.
//!
//! Control traffic is JSON text frames tagged by `msgType`. Media fragments travel as
//! binary frames: a 4-byte big-endian header length, a JSON [`ChunkHeader`], then the
//! raw bytes (see [`encode_chunk_frame`] / [`decode_chunk_frame`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Index of a media fragment within one participant's stream
pub type ChunkIndex = u64;

/// Connection-scoped peer identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Allocate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PeerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for PeerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Positional role of a peer within a room, assigned in join order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    First,
    Second,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::First, Slot::Second];

    pub fn as_str(self) -> &'static str {
        match self {
            Slot::First => "first",
            Slot::Second => "second",
        }
    }

    pub fn index(self) -> usize {
        match self {
            Slot::First => 0,
            Slot::Second => 1,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of connection-negotiation message. Payloads are never interpreted by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationKind {
    Offer,
    Answer,
    Candidate,
}

impl NegotiationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NegotiationKind::Offer => "offer",
            NegotiationKind::Answer => "answer",
            NegotiationKind::Candidate => "candidate",
        }
    }
}

/// Another member of a room as announced to a peer
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub identity: String,
    pub slot: Slot,
}

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msgType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join (or lazily create) a two-party room
    /// # Fields
    /// * `room_id` - Caller-chosen room code
    /// * `identity` - Display identity, normally an email address
    /// * `token` - Optional credential for the identity provider
    JoinRoom {
        room_id: String,
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Offer {
        to: PeerId,
        payload: serde_json::Value,
    },
    Answer {
        to: PeerId,
        payload: serde_json::Value,
    },
    Candidate {
        to: PeerId,
        payload: serde_json::Value,
    },
    /// Explicit departure, distinct from the transport closing
    LeaveNotify { room_id: String },
}

impl ClientMessage {
    /// Split a negotiation message into its parts; `None` for every other variant.
    pub fn as_negotiation(&self) -> Option<(NegotiationKind, PeerId, &serde_json::Value)> {
        match self {
            ClientMessage::Offer { to, payload } => Some((NegotiationKind::Offer, *to, payload)),
            ClientMessage::Answer { to, payload } => Some((NegotiationKind::Answer, *to, payload)),
            ClientMessage::Candidate { to, payload } => {
                Some((NegotiationKind::Candidate, *to, payload))
            },
            _ => None,
        }
    }
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msgType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Join accepted
    Joined {
        room_id: String,
        peer_id: PeerId,
        slot: Slot,
        /// Members already present
        peers: Vec<PeerInfo>,
    },
    /// Another peer entered the room
    PeerJoined { peer_id: PeerId, identity: String },
    /// Join rejected, the room already holds two peers
    RoomFull,
    Offer {
        from: PeerId,
        payload: serde_json::Value,
    },
    Answer {
        from: PeerId,
        payload: serde_json::Value,
    },
    Candidate {
        from: PeerId,
        payload: serde_json::Value,
    },
    /// A room member left or disconnected
    PeerLeft { peer_id: PeerId, identity: String },
    /// A media chunk could not be persisted
    ChunkError {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chunk_index: Option<ChunkIndex>,
    },
    /// Protocol or validation failure
    Error { code: String, message: String },
}

impl ServerMessage {
    /// Build the server-side negotiation message of the given kind
    pub fn negotiation(kind: NegotiationKind, from: PeerId, payload: serde_json::Value) -> Self {
        match kind {
            NegotiationKind::Offer => ServerMessage::Offer { from, payload },
            NegotiationKind::Answer => ServerMessage::Answer { from, payload },
            NegotiationKind::Candidate => ServerMessage::Candidate { from, payload },
        }
    }
}

/// Metadata preceding the bytes of a binary media frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub room_id: String,
    pub chunk_index: ChunkIndex,
    pub mime_type: String,
    /// Client capture time, unix milliseconds
    pub timestamp: i64,
}

/// Errors decoding a binary media frame
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("header length {declared} exceeds frame body of {available} bytes")]
    HeaderLength { declared: usize, available: usize },

    #[error("invalid chunk header: {0}")]
    Header(#[from] serde_json::Error),
}

const LEN_PREFIX: usize = 4;

/// Encode a media chunk as `len(header) ‖ header json ‖ payload`
pub fn encode_chunk_frame(header: &ChunkHeader, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let header_json = serde_json::to_vec(header)?;
    let header_len = u32::try_from(header_json.len()).map_err(|_| FrameError::HeaderLength {
        declared: header_json.len(),
        available: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + header_json.len() + payload.len());
    frame.extend_from_slice(&header_len.to_be_bytes());
    frame.extend_from_slice(&header_json);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a binary media frame into its header and a borrowed payload
pub fn decode_chunk_frame(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), FrameError> {
    let Some((prefix, body)) = frame.split_first_chunk::<LEN_PREFIX>() else {
        return Err(FrameError::TooShort(frame.len()));
    };
    let declared = u32::from_be_bytes(*prefix) as usize;
    if declared > body.len() {
        return Err(FrameError::HeaderLength {
            declared,
            available: body.len(),
        });
    }

    let (header, payload) = body.split_at(declared);
    let header: ChunkHeader = serde_json::from_slice(header)?;
    Ok((header, payload))
}
