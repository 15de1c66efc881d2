// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! Per-connection WebSocket handler.
//!
//! One `WebSocketHandler` per socket. It owns the peer's identity for the lifetime of the
//! connection, turns decoded frames into coordinator commands, and answers protocol and
//! validation failures on the peer's own channel. Everything stateful happens in the
//! coordinator.

use crate::error::AppError;
use crate::relay::Outbox;
use crate::validation;
use crate::AppState;
use duet_common::{decode_chunk_frame, ClientMessage, PeerId, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct WebSocketHandler {
    state: Arc<AppState>,
    peer_id: PeerId,
}

impl WebSocketHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self {
            state,
            peer_id: PeerId::new(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Register the peer; everything addressed to it arrives on the returned receiver
    pub fn open(&self) -> Result<mpsc::UnboundedReceiver<ServerMessage>, AppError> {
        let rx = self.state.hub.subscribe(self.peer_id);
        if let Err(e) = self.state.coordinator.connect(self.peer_id) {
            self.state.hub.unsubscribe(self.peer_id);
            return Err(e);
        }
        tracing::debug!(peer_id = %self.peer_id, "peer connected");
        Ok(rx)
    }

    /// Handle a text frame
    pub async fn handle_text(&self, text: &str) -> Result<(), AppError> {
        let message: ClientMessage = serde_json::from_str(text)?;
        validation::validate_client_message(&message)?;

        if let Some((kind, to, payload)) = message.as_negotiation() {
            return self
                .state
                .coordinator
                .relay(kind, self.peer_id, to, payload.clone());
        }

        match message {
            ClientMessage::JoinRoom {
                room_id,
                identity,
                token,
            } => {
                let identity = self.state.auth.verify(token.as_deref(), &identity).await?;
                self.state.coordinator.join(self.peer_id, room_id, identity)
            },
            ClientMessage::LeaveNotify { room_id } => {
                self.state.coordinator.leave(self.peer_id, room_id)
            },
            ClientMessage::Offer { .. }
            | ClientMessage::Answer { .. }
            | ClientMessage::Candidate { .. } => Ok(()),
        }
    }

    /// Handle a binary media-chunk frame
    pub fn handle_binary(&self, frame: &[u8]) -> Result<(), AppError> {
        let (header, payload) = decode_chunk_frame(frame)?;
        validation::validate_chunk(
            &header,
            payload.len(),
            self.state.settings.recording.max_chunk_bytes,
        )?;
        self.state
            .coordinator
            .chunk(self.peer_id, header, payload.to_vec())
    }

    /// Answer a failed frame on the peer's own channel
    pub fn reply_error(&self, err: &AppError) {
        tracing::debug!(peer_id = %self.peer_id, code = err.error_code(), error = %err, "frame rejected");
        self.state
            .hub
            .unicast(self.peer_id, err.to_server_message());
    }

    /// The transport closed: leave any room and stop delivery
    pub fn close(&self) {
        if let Err(e) = self.state.coordinator.disconnect(self.peer_id) {
            tracing::warn!(peer_id = %self.peer_id, error = %e, "disconnect not delivered");
        }
        self.state.hub.unsubscribe(self.peer_id);
        tracing::debug!(peer_id = %self.peer_id, "peer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use duet_common::{encode_chunk_frame, ChunkHeader, Slot};
    use serde_json::json;
    use tempfile::TempDir;

    /// Helper to set up a `WebSocketHandler` for testing
    fn setup() -> (Arc<AppState>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            data_dir: temp_dir.path().to_path_buf(),
            ..Settings::default()
        };
        let state = Arc::new(AppState::new(settings).unwrap());
        (state, temp_dir)
    }

    fn error_code(msg: ServerMessage) -> String {
        match msg {
            ServerMessage::Error { code, .. } => code,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_room() {
        let (state, _temp_dir) = setup();
        let handler = WebSocketHandler::new(state.clone());
        let mut rx = handler.open().unwrap();

        handler
            .handle_text(r#"{"msgType":"join-room","roomId":"r1","identity":"ana@example.com"}"#)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            ServerMessage::Joined {
                room_id,
                peer_id,
                slot,
                peers,
            } => {
                assert_eq!(room_id, "r1");
                assert_eq!(peer_id, handler.peer_id());
                assert_eq!(slot, Slot::First);
                assert!(peers.is_empty());
            },
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_text_is_rejected() {
        let (state, _temp_dir) = setup();
        let handler = WebSocketHandler::new(state);
        let mut rx = handler.open().unwrap();

        let err = handler.handle_text("{not json").await.unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_MESSAGE");
        handler.reply_error(&err);
        assert_eq!(error_code(rx.recv().await.unwrap()), "MALFORMED_MESSAGE");
    }

    #[tokio::test]
    async fn test_invalid_room_and_identity() {
        let (state, _temp_dir) = setup();
        let handler = WebSocketHandler::new(state.clone());
        let _rx = handler.open().unwrap();

        let err = handler
            .handle_text(r#"{"msgType":"join-room","roomId":"../x","identity":"ana@example.com"}"#)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = handler
            .handle_text(r#"{"msgType":"join-room","roomId":"r1","identity":"ana"}"#)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let snapshot = state.coordinator.snapshot().await.unwrap();
        assert!(snapshot.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_credential_is_reported() {
        use crate::auth::{AuthService, Identity};
        use crate::catalog::TracingCatalog;
        use crate::merge::FfmpegTranscoder;
        use crate::storage::FlatFileStorage;

        struct DenyAll;

        #[async_trait::async_trait]
        impl AuthService for DenyAll {
            async fn verify(&self, _token: Option<&str>, _claimed: &str) -> Result<Identity, AppError> {
                Err(AppError::Auth("token expired".to_string()))
            }
        }

        let temp_dir = TempDir::new().unwrap();
        let settings = Settings {
            data_dir: temp_dir.path().to_path_buf(),
            ..Settings::default()
        };
        let transcoder = Arc::new(FfmpegTranscoder::new(settings.merge.clone()));
        let state = Arc::new(AppState::with_parts(
            settings,
            Arc::new(DenyAll),
            Arc::new(FlatFileStorage::new(temp_dir.path()).unwrap()),
            transcoder,
            Arc::new(TracingCatalog),
        ));
        let handler = WebSocketHandler::new(state.clone());
        let _rx = handler.open().unwrap();

        let err = handler
            .handle_text(r#"{"msgType":"join-room","roomId":"r1","identity":"ana@example.com","token":"t"}"#)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "AUTH_001");
        assert!(state.coordinator.snapshot().await.unwrap().rooms.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_chunk_frame() {
        let (state, _temp_dir) = setup();
        let handler = WebSocketHandler::new(state);
        let _rx = handler.open().unwrap();

        let err = handler.handle_binary(&[0, 0]).unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_CHUNK");

        let header = ChunkHeader {
            room_id: "r1".to_string(),
            chunk_index: 0,
            mime_type: "video/webm".to_string(),
            timestamp: 0,
        };
        let empty = encode_chunk_frame(&header, &[]).unwrap();
        assert_eq!(
            handler.handle_binary(&empty).unwrap_err().error_code(),
            "VALIDATION_ERROR"
        );
    }

    #[tokio::test]
    async fn test_offer_is_relayed_between_handlers() {
        let (state, _temp_dir) = setup();
        let alice = WebSocketHandler::new(state.clone());
        let bob = WebSocketHandler::new(state.clone());
        let _alice_rx = alice.open().unwrap();
        let mut bob_rx = bob.open().unwrap();

        let offer = ClientMessage::Offer {
            to: bob.peer_id(),
            payload: json!({ "type": "offer", "sdp": "v=0" }),
        };
        alice
            .handle_text(&serde_json::to_string(&offer).unwrap())
            .await
            .unwrap();

        assert_eq!(
            bob_rx.recv().await.unwrap(),
            ServerMessage::Offer {
                from: alice.peer_id(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            }
        );
    }

    #[tokio::test]
    async fn test_close_notifies_room() {
        let (state, _temp_dir) = setup();
        let alice = WebSocketHandler::new(state.clone());
        let bob = WebSocketHandler::new(state.clone());
        let mut alice_rx = alice.open().unwrap();
        let _bob_rx = bob.open().unwrap();

        alice
            .handle_text(r#"{"msgType":"join-room","roomId":"r1","identity":"ana@example.com"}"#)
            .await
            .unwrap();
        bob.handle_text(r#"{"msgType":"join-room","roomId":"r1","identity":"bo@example.com"}"#)
            .await
            .unwrap();
        bob.close();

        // joined, peer-joined, peer-left
        alice_rx.recv().await.unwrap();
        alice_rx.recv().await.unwrap();
        assert_eq!(
            alice_rx.recv().await.unwrap(),
            ServerMessage::PeerLeft {
                peer_id: bob.peer_id(),
                identity: "bo@example.com".to_string()
            }
        );
        assert!(!state.hub.is_connected(bob.peer_id()));
    }
}
