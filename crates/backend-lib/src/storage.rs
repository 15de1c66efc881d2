// ============================
// duet-backend-lib/src/storage.rs
// ============================
//! Storage abstraction with flat-file implementation.
//!
//! Every recording session owns one directory, `<root>/<room_id>/<session_id>/`. The
//! session manager resolves the [`SessionDir`] handle when a session activates and the
//! directory is created off the dispatch loop; the chunk writer and the merge pipeline only
//! ever reach the filesystem through that handle.
use crate::error::AppError;
use async_trait::async_trait;
use duet_common::Slot;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tokio::fs as tokio_fs;
use uuid::Uuid;

/// File name of a completed composite recording
pub const MERGED_OUTPUT: &str = "merged_output.mp4";
/// File the transcoder writes before it is renamed into place
pub const PARTIAL_OUTPUT: &str = "merged_output.partial.mp4";

/// Trait for storage backends
#[async_trait]
pub trait Storage: Send + Sync {
    /// Where a session's directory lives. Touches nothing on disk.
    fn session_dir(&self, room_id: &str, session_id: Uuid) -> SessionDir;

    /// Create the directory for a new session
    async fn create_session_dir(
        &self,
        room_id: &str,
        session_id: Uuid,
    ) -> Result<SessionDir, AppError>;

    /// Session directories that still hold per-slot artifacts (never merged)
    async fn unmerged_sessions(&self) -> Result<Vec<SessionDir>, AppError>;
}

/// Flat-file implementation of the Storage trait
#[derive(Clone, Debug)]
pub struct FlatFileStorage {
    root: PathBuf,
}

impl FlatFileStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, AppError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Storage for FlatFileStorage {
    fn session_dir(&self, room_id: &str, session_id: Uuid) -> SessionDir {
        SessionDir::from_path(self.root.join(room_id).join(session_id.to_string()))
    }

    async fn create_session_dir(
        &self,
        room_id: &str,
        session_id: Uuid,
    ) -> Result<SessionDir, AppError> {
        let dir = self.session_dir(room_id, session_id);
        tokio_fs::create_dir_all(dir.path()).await?;
        Ok(dir)
    }

    async fn unmerged_sessions(&self) -> Result<Vec<SessionDir>, AppError> {
        let mut found = Vec::new();
        let mut rooms = tokio_fs::read_dir(&self.root).await?;
        while let Some(room) = rooms.next_entry().await? {
            if !room.file_type().await?.is_dir() {
                continue;
            }
            let mut sessions = tokio_fs::read_dir(room.path()).await?;
            while let Some(session) = sessions.next_entry().await? {
                if !session.file_type().await?.is_dir() {
                    continue;
                }
                let dir = SessionDir::from_path(session.path());
                if !dir.artifacts().await?.is_empty() {
                    found.push(dir);
                }
            }
        }
        found.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(found)
    }
}

/// Handle to one session's directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDir {
    path: PathBuf,
}

impl SessionDir {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Per-slot artifact: `<slot>-<identity>.<ext>`
    pub fn slot_artifact_path(&self, slot: Slot, identity: &str, mime_type: &str) -> PathBuf {
        self.path.join(format!(
            "{}-{}.{}",
            slot.as_str(),
            sanitize_file_component(identity),
            extension_for_mime(mime_type)
        ))
    }

    pub fn merged_output_path(&self) -> PathBuf {
        self.path.join(MERGED_OUTPUT)
    }

    pub fn partial_output_path(&self) -> PathBuf {
        self.path.join(PARTIAL_OUTPUT)
    }

    /// Per-slot artifacts currently on disk, ordered first slot then second.
    /// A missing directory has no artifacts.
    pub async fn artifacts(&self) -> io::Result<Vec<PathBuf>> {
        let mut entries = match tokio_fs::read_dir(&self.path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut by_slot: [Option<PathBuf>; 2] = [None, None];
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(slot) = name.to_str().and_then(artifact_slot) else {
                continue;
            };
            // zero-length files carry no media
            if entry.metadata().await?.len() == 0 {
                continue;
            }
            by_slot[slot.index()].get_or_insert(entry.path());
        }

        Ok(by_slot.into_iter().flatten().collect())
    }
}

/// Slot encoded in an artifact file name
fn artifact_slot(file_name: &str) -> Option<Slot> {
    Slot::ALL
        .into_iter()
        .find(|slot| file_name.starts_with(&format!("{}-", slot.as_str())))
}

/// Container extension for a recorder MIME type such as `video/webm;codecs=vp8,opus`
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let essence = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "video/webm" | "audio/webm" => "webm",
        "video/mp4" | "audio/mp4" => "mp4",
        "video/x-matroska" | "video/matroska" => "mkv",
        "audio/ogg" | "video/ogg" => "ogg",
        _ => "bin",
    }
}

/// Keep identities usable as file names
fn sanitize_file_component(input: &str) -> String {
    let cleaned: String = input
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '@' | '.' | '_' | '-' | '+' => c,
            _ => '_',
        })
        .collect();
    let trimmed = cleaned.trim_start_matches('.');
    if trimmed.is_empty() {
        "participant".to_string()
    } else {
        trimmed.to_string()
    }
}
