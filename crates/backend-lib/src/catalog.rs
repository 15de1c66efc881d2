// ============================
// duet-backend-lib/src/catalog.rs
// ============================
//! Hand-off of finished recordings to whatever keeps the user/video records.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duet_common::Slot;
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// A merged recording ready to be listed for its participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedRecording {
    pub session_id: Uuid,
    pub room_id: String,
    pub participants: Vec<(Slot, String)>,
    pub output: PathBuf,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait RecordingCatalog: Send + Sync {
    /// Called once per successfully merged session
    async fn recording_completed(&self, recording: CompletedRecording);
}

/// Logs completed recordings
#[derive(Debug, Default, Clone)]
pub struct TracingCatalog;

#[async_trait]
impl RecordingCatalog for TracingCatalog {
    async fn recording_completed(&self, recording: CompletedRecording) {
        let identities: Vec<&str> = recording
            .participants
            .iter()
            .map(|(_, identity)| identity.as_str())
            .collect();
        tracing::info!(
            session_id = %recording.session_id,
            room_id = %recording.room_id,
            participants = ?identities,
            output = %recording.output.display(),
            "recording available"
        );
    }
}
