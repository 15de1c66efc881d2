// ============================
// crates/backend-lib/src/validation/mod.rs
// ============================
//! Message validation module.

use duet_common::{ChunkHeader, ClientMessage};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

const MAX_ROOM_ID_LENGTH: usize = 64;
const MAX_IDENTITY_LENGTH: usize = 254; // RFC 5321 SMTP limit
const MAX_MIME_TYPE_LENGTH: usize = 255;

// Room ids become directory names, so keep them path-safe
static ROOM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("valid room id pattern"));
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email pattern")
});

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid chunk: {0}")]
    InvalidChunk(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a room ID
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    if room_id.is_empty() {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must not be empty".to_string(),
        ));
    }

    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err(ValidationError::InvalidRoomId(format!(
            "Room ID must be at most {MAX_ROOM_ID_LENGTH} characters"
        )));
    }

    if !ROOM_ID_REGEX.is_match(room_id) {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must contain only alphanumeric characters, hyphens and underscores"
                .to_string(),
        ));
    }

    Ok(room_id)
}

/// Validate a participant identity (an email address)
pub fn validate_identity(identity: &str) -> ValidationResult<&str> {
    if identity.is_empty() {
        return Err(ValidationError::InvalidIdentity(
            "Identity must not be empty".to_string(),
        ));
    }

    if identity.len() > MAX_IDENTITY_LENGTH {
        return Err(ValidationError::InvalidIdentity(format!(
            "Identity cannot exceed {MAX_IDENTITY_LENGTH} characters"
        )));
    }

    if !EMAIL_REGEX.is_match(identity) {
        return Err(ValidationError::InvalidIdentity(
            "Identity must be an email address".to_string(),
        ));
    }

    Ok(identity)
}

/// Validate a media chunk header and payload size
pub fn validate_chunk(
    header: &ChunkHeader,
    payload_len: usize,
    max_chunk_bytes: usize,
) -> ValidationResult<()> {
    validate_room_id(&header.room_id)?;

    if payload_len == 0 {
        return Err(ValidationError::InvalidChunk(format!(
            "Chunk {} has an empty payload",
            header.chunk_index
        )));
    }

    if payload_len > max_chunk_bytes {
        return Err(ValidationError::InvalidChunk(format!(
            "Chunk {} is {payload_len} bytes, limit is {max_chunk_bytes}",
            header.chunk_index
        )));
    }

    let mime = header.mime_type.trim();
    if mime.is_empty() || mime.len() > MAX_MIME_TYPE_LENGTH || !mime.contains('/') {
        return Err(ValidationError::InvalidChunk(format!(
            "Chunk {} has an invalid MIME type",
            header.chunk_index
        )));
    }

    Ok(())
}

/// Validate a client message. Negotiation payloads are opaque and never inspected.
pub fn validate_client_message(message: &ClientMessage) -> ValidationResult<()> {
    match message {
        ClientMessage::JoinRoom {
            room_id, identity, ..
        } => {
            validate_room_id(room_id)?;
            validate_identity(identity)?;
        },
        ClientMessage::LeaveNotify { room_id } => {
            validate_room_id(room_id)?;
        },
        ClientMessage::Offer { .. }
        | ClientMessage::Answer { .. }
        | ClientMessage::Candidate { .. } => {},
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use duet_common::PeerId;

    fn header(room_id: &str, mime_type: &str) -> ChunkHeader {
        ChunkHeader {
            room_id: room_id.to_string(),
            chunk_index: 0,
            mime_type: mime_type.to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_validate_room_id() {
        assert!(validate_room_id("k3x9q").is_ok());
        assert!(validate_room_id("team_sync-01").is_ok());

        assert!(validate_room_id("").is_err());
        assert!(validate_room_id("../etc").is_err());
        assert!(validate_room_id("a/b").is_err());
        assert!(validate_room_id(&"a".repeat(MAX_ROOM_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_validate_identity() {
        assert!(validate_identity("ana@example.com").is_ok());
        assert!(validate_identity("first.last+tag@sub.example.org").is_ok());

        assert!(validate_identity("").is_err());
        assert!(validate_identity("not-an-email").is_err());
        assert!(validate_identity("ana@example").is_err());
    }

    #[test]
    fn test_validate_chunk() {
        let ok = header("r1", "video/webm;codecs=vp8,opus");
        assert!(validate_chunk(&ok, 500, 1024).is_ok());

        assert!(validate_chunk(&ok, 0, 1024).is_err());
        assert!(validate_chunk(&ok, 2048, 1024).is_err());
        assert!(validate_chunk(&header("r1", ""), 10, 1024).is_err());
        assert!(validate_chunk(&header("r1", "webm"), 10, 1024).is_err());
        assert!(validate_chunk(&header("bad room", "video/mp4"), 10, 1024).is_err());
    }

    #[test]
    fn test_validate_client_message() {
        let join = ClientMessage::JoinRoom {
            room_id: "r1".to_string(),
            identity: "ana@example.com".to_string(),
            token: None,
        };
        assert!(validate_client_message(&join).is_ok());

        let bad_join = ClientMessage::JoinRoom {
            room_id: "r1".to_string(),
            identity: "ana".to_string(),
            token: None,
        };
        assert!(matches!(
            validate_client_message(&bad_join),
            Err(ValidationError::InvalidIdentity(_))
        ));

        let offer = ClientMessage::Offer {
            to: PeerId::new(),
            payload: serde_json::json!("anything at all"),
        };
        assert!(validate_client_message(&offer).is_ok());
    }
}
