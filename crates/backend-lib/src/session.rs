// ============================
// duet-backend-lib/src/session.rs
// ============================
//! Recording session lifecycle.
//!
//! One [`RecordingSession`] per room, driven by registry events:
//!
//! ```text
//! Empty -> AwaitingSecond -> Active -> Closing -> Merged | Failed
//! ```
//!
//! Transitions only move forward. The session directory is assigned when the second peer
//! joins and created by the coordinator off its loop; if that fails the session is
//! abandoned. A session abandoned while awaiting its second peer is discarded without a
//! directory or a merge. A session closes on the first departure of either participant and
//! closes at most once. Once a room's session has closed, the next pair in that room gets
//! a fresh session.
use crate::merge::MergeError;
use crate::metrics::{
    CHUNK_ACCEPTED, CHUNK_DROPPED, CHUNK_REJECTED, SESSIONS_ACTIVE, SESSION_CLOSED,
    SESSION_DISCARDED, SESSION_OPENED,
};
use crate::relay::Outbox;
use crate::storage::{SessionDir, Storage};
use crate::writer::{SlotArtifact, SlotWriter, WriteError, WriterConfig};
use chrono::{DateTime, Utc};
use duet_common::{ChunkHeader, PeerId, Slot};
use metrics::{counter, gauge};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Empty,
    AwaitingSecond,
    Active,
    Closing,
    Merged,
    Failed,
}

impl SessionState {
    /// Whether `next` is the legal successor of `self`
    pub fn can_advance_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Empty, AwaitingSecond)
                | (AwaitingSecond, Active)
                | (Active, Closing)
                | (Closing, Merged)
                | (Closing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Merged | SessionState::Failed)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session for room {0} is already closing")]
    AlreadyClosing(String),

    #[error("invalid session transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("room {0} has no session awaiting a second participant")]
    NotAwaiting(String),

    #[error("room {0} already has a session")]
    AlreadyOpen(String),

    #[error("could not prepare session storage: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Participant {
    peer_id: PeerId,
    identity: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SlotCounters {
    chunks: u64,
    bytes: u64,
}

/// A room's recording session
pub struct RecordingSession {
    session_id: Uuid,
    room_id: String,
    state: SessionState,
    participants: [Option<Participant>; 2],
    counters: [SlotCounters; 2],
    writers: [Option<SlotWriter>; 2],
    dir: Option<SessionDir>,
    created_at: DateTime<Utc>,
    activated_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
}

impl RecordingSession {
    fn new(room_id: &str) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            state: SessionState::Empty,
            participants: [None, None],
            counters: [SlotCounters::default(); 2],
            writers: [None, None],
            dir: None,
            created_at: Utc::now(),
            activated_at: None,
            closed_at: None,
        }
    }

    fn advance(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_advance_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!(
            session_id = %self.session_id,
            room_id = %self.room_id,
            from = ?self.state,
            to = ?next,
            "session transition"
        );
        self.state = next;
        Ok(())
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn dir(&self) -> Option<&SessionDir> {
        self.dir.as_ref()
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            room_id: self.room_id.clone(),
            state: self.state,
            participants: Slot::ALL
                .into_iter()
                .filter_map(|slot| {
                    let participant = self.participants[slot.index()].as_ref()?;
                    let counters = self.counters[slot.index()];
                    Some(ParticipantSummary {
                        slot,
                        identity: participant.identity.clone(),
                        chunks: counters.chunks,
                        bytes: counters.bytes,
                    })
                })
                .collect(),
            dir: self.dir.as_ref().map(|dir| dir.path().to_path_buf()),
            created_at: self.created_at,
            activated_at: self.activated_at,
            closed_at: self.closed_at,
            finished_at: None,
            output: None,
            failure: None,
        }
    }
}

/// Per-slot line of a [`SessionSummary`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSummary {
    pub slot: Slot,
    pub identity: String,
    /// Chunks accepted into the write queue
    pub chunks: u64,
    pub bytes: u64,
}

/// Point-in-time view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub room_id: String,
    pub state: SessionState,
    pub participants: Vec<ParticipantSummary>,
    pub dir: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub output: Option<PathBuf>,
    pub failure: Option<String>,
}

/// Everything the merge task needs once a session has closed
pub struct CloseTicket {
    pub session_id: Uuid,
    pub room_id: String,
    pub dir: SessionDir,
    pub writers: Vec<SlotWriter>,
    /// Identities ordered by slot
    pub participants: Vec<(Slot, String)>,
}

impl std::fmt::Debug for CloseTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseTicket")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("dir", &self.dir)
            .field("writers", &self.writers.len())
            .finish()
    }
}

/// Result of a close trigger
#[derive(Debug)]
pub enum CloseOutcome {
    /// The room had no session
    NoSession,
    /// The session never reached `Active`; nothing to merge
    Discarded(Uuid),
    /// The session is now `Closing` and must be merged
    Closing(CloseTicket),
}

/// Fate of an incoming chunk that was not rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkDisposition {
    Queued,
    /// No active session in the room
    Dropped,
}

/// Owns every session and its directory. Mutated only from the coordinator loop.
pub struct SessionManager {
    storage: Arc<dyn Storage>,
    outbox: Arc<dyn Outbox>,
    writer_config: WriterConfig,
    /// Sessions not yet closed, by room
    active: HashMap<String, RecordingSession>,
    /// Sessions being merged, by id
    closing: HashMap<Uuid, RecordingSession>,
    history: VecDeque<SessionSummary>,
    history_limit: usize,
}

impl SessionManager {
    pub fn new(
        storage: Arc<dyn Storage>,
        outbox: Arc<dyn Outbox>,
        writer_config: WriterConfig,
        history_limit: usize,
    ) -> Self {
        Self {
            storage,
            outbox,
            writer_config,
            active: HashMap::new(),
            closing: HashMap::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    /// First peer joined: `Empty -> AwaitingSecond`
    pub fn open(
        &mut self,
        room_id: &str,
        slot: Slot,
        peer_id: PeerId,
        identity: &str,
    ) -> Result<Uuid, SessionError> {
        if self.active.contains_key(room_id) {
            return Err(SessionError::AlreadyOpen(room_id.to_string()));
        }

        let mut session = RecordingSession::new(room_id);
        session.advance(SessionState::AwaitingSecond)?;
        session.participants[slot.index()] = Some(Participant {
            peer_id,
            identity: identity.to_string(),
        });
        let session_id = session.session_id;
        self.active.insert(room_id.to_string(), session);
        self.report_active();

        tracing::info!(%session_id, room_id, "recording session awaiting second participant");
        Ok(session_id)
    }

    /// Second peer joined: `AwaitingSecond -> Active`, assigning the session directory.
    /// The caller creates the directory; see [`SessionManager::abandon`] if that fails.
    pub fn activate(
        &mut self,
        room_id: &str,
        slot: Slot,
        peer_id: PeerId,
        identity: &str,
    ) -> Result<(Uuid, SessionDir), SessionError> {
        let session = self
            .active
            .get_mut(room_id)
            .filter(|session| session.state == SessionState::AwaitingSecond)
            .ok_or_else(|| SessionError::NotAwaiting(room_id.to_string()))?;
        let session_id = session.session_id;
        let dir = self.storage.session_dir(room_id, session_id);

        session.advance(SessionState::Active)?;
        session.participants[slot.index()] = Some(Participant {
            peer_id,
            identity: identity.to_string(),
        });
        session.activated_at = Some(Utc::now());
        session.dir = Some(dir.clone());
        counter!(SESSION_OPENED).increment(1);

        tracing::info!(
            %session_id,
            room_id,
            dir = %dir.path().display(),
            "recording session active"
        );
        Ok((session_id, dir))
    }

    /// Drop a session whose storage could not be prepared; the call goes on without
    /// recording. `false` if the session is no longer active.
    pub fn abandon(&mut self, session_id: Uuid, reason: &str) -> bool {
        let Some(room_id) = self
            .active
            .iter()
            .find(|(_, session)| session.session_id == session_id)
            .map(|(room_id, _)| room_id.clone())
        else {
            return false;
        };
        // dropping the writers lets their tasks drain and exit
        self.active.remove(&room_id);
        self.report_active();
        counter!(SESSION_DISCARDED).increment(1);
        tracing::error!(%session_id, room_id, reason, "session storage unavailable, recording abandoned");
        true
    }

    /// Route a chunk to its slot writer, spawning the writer on the slot's first chunk
    pub fn write_chunk(
        &mut self,
        slot: Slot,
        peer_id: PeerId,
        header: &ChunkHeader,
        payload: Vec<u8>,
    ) -> Result<ChunkDisposition, WriteError> {
        let Some(session) = self
            .active
            .get_mut(&header.room_id)
            .filter(|session| session.state == SessionState::Active)
        else {
            counter!(CHUNK_DROPPED).increment(1);
            tracing::debug!(
                room_id = %header.room_id,
                chunk_index = header.chunk_index,
                "no active session, chunk dropped"
            );
            return Ok(ChunkDisposition::Dropped);
        };

        let owner = session.participants[slot.index()]
            .as_ref()
            .filter(|participant| participant.peer_id == peer_id);
        let (Some(owner), Some(dir)) = (owner, session.dir.as_ref()) else {
            counter!(CHUNK_DROPPED).increment(1);
            tracing::debug!(%peer_id, room_id = %header.room_id, "chunk from non-participant dropped");
            return Ok(ChunkDisposition::Dropped);
        };

        let writer = session.writers[slot.index()].get_or_insert_with(|| {
            SlotWriter::spawn(
                slot,
                dir.slot_artifact_path(slot, &owner.identity, &header.mime_type),
                header.mime_type.clone(),
                peer_id,
                self.outbox.clone(),
                self.writer_config,
            )
        });

        let len = payload.len() as u64;
        match writer.write(header.chunk_index, payload) {
            Ok(()) => {
                let counters = &mut session.counters[slot.index()];
                counters.chunks += 1;
                counters.bytes += len;
                counter!(CHUNK_ACCEPTED).increment(1);
                Ok(ChunkDisposition::Queued)
            },
            Err(e) => {
                counter!(CHUNK_REJECTED).increment(1);
                Err(e)
            },
        }
    }

    /// Close a room's session. A room whose session is already closing yields
    /// [`SessionError::AlreadyClosing`], which callers treat as a no-op.
    pub fn close(&mut self, room_id: &str) -> Result<CloseOutcome, SessionError> {
        let Some(mut session) = self.active.remove(room_id) else {
            if self.closing.values().any(|session| session.room_id == room_id) {
                return Err(SessionError::AlreadyClosing(room_id.to_string()));
            }
            return Ok(CloseOutcome::NoSession);
        };

        if session.state != SessionState::Active {
            let session_id = session.session_id;
            self.report_active();
            counter!(SESSION_DISCARDED).increment(1);
            tracing::info!(%session_id, room_id, "session never became active, discarded");
            return Ok(CloseOutcome::Discarded(session_id));
        }

        session.advance(SessionState::Closing)?;
        session.closed_at = Some(Utc::now());
        let dir = session
            .dir
            .clone()
            .ok_or_else(|| SessionError::Storage("active session without directory".to_string()))?;
        let writers = session.writers.iter_mut().filter_map(Option::take).collect();
        let participants = Slot::ALL
            .into_iter()
            .filter_map(|slot| {
                let participant = session.participants[slot.index()].as_ref()?;
                Some((slot, participant.identity.clone()))
            })
            .collect();

        let ticket = CloseTicket {
            session_id: session.session_id,
            room_id: room_id.to_string(),
            dir,
            writers,
            participants,
        };
        self.closing.insert(session.session_id, session);
        self.report_active();

        tracing::info!(session_id = %ticket.session_id, room_id, "session closing");
        Ok(CloseOutcome::Closing(ticket))
    }

    /// Record a finished merge: `Closing -> Merged | Failed`
    pub fn finish_merge(
        &mut self,
        session_id: Uuid,
        artifacts: &[SlotArtifact],
        result: &Result<PathBuf, MergeError>,
    ) -> Option<SessionSummary> {
        let mut session = self.closing.remove(&session_id)?;
        let next = if result.is_ok() {
            SessionState::Merged
        } else {
            SessionState::Failed
        };
        if let Err(e) = session.advance(next) {
            tracing::error!(%session_id, error = %e, "cannot finish session");
            return None;
        }

        let mut summary = session.summary();
        summary.finished_at = Some(Utc::now());
        match result {
            Ok(output) => summary.output = Some(output.clone()),
            Err(e) => summary.failure = Some(e.to_string()),
        }
        for artifact in artifacts {
            if let Some(failure) = &artifact.failure {
                tracing::warn!(
                    %session_id,
                    slot = %artifact.slot,
                    failure,
                    "slot recording was incomplete"
                );
            }
        }

        let outcome = if result.is_ok() { "merged" } else { "failed" };
        counter!(SESSION_CLOSED, "outcome" => outcome).increment(1);
        self.report_active();

        self.history.push_back(summary.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        Some(summary)
    }

    /// Current state of a room's session; `Empty` if there is none
    pub fn state_of(&self, room_id: &str) -> SessionState {
        if let Some(session) = self.active.get(room_id) {
            return session.state;
        }
        self.closing
            .values()
            .find(|session| session.room_id == room_id)
            .map_or(SessionState::Empty, |session| session.state)
    }

    pub fn session(&self, room_id: &str) -> Option<&RecordingSession> {
        self.active.get(room_id)
    }

    /// Sessions not yet finished, ordered by creation
    pub fn live(&self) -> Vec<SessionSummary> {
        let mut live: Vec<SessionSummary> = self
            .active
            .values()
            .chain(self.closing.values())
            .map(RecordingSession::summary)
            .collect();
        live.sort_by_key(|summary| summary.created_at);
        live
    }

    /// Finished sessions, oldest first
    pub fn history(&self) -> Vec<SessionSummary> {
        self.history.iter().cloned().collect()
    }

    fn report_active(&self) {
        gauge!(SESSIONS_ACTIVE).set((self.active.len() + self.closing.len()) as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::PeerHub;
    use crate::storage::FlatFileStorage;
    use tempfile::TempDir;

    const ANA: &str = "ana@example.com";
    const BO: &str = "bo@example.com";

    fn manager(temp_dir: &TempDir, history_limit: usize) -> SessionManager {
        let storage = Arc::new(FlatFileStorage::new(temp_dir.path()).unwrap());
        SessionManager::new(
            storage,
            Arc::new(PeerHub::new()),
            WriterConfig::default(),
            history_limit,
        )
    }

    fn header(room_id: &str, chunk_index: u64) -> ChunkHeader {
        ChunkHeader {
            room_id: room_id.to_string(),
            chunk_index,
            mime_type: "video/webm;codecs=vp8,opus".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use SessionState::*;
        assert!(Empty.can_advance_to(AwaitingSecond));
        assert!(Closing.can_advance_to(Failed));
        assert!(!Active.can_advance_to(AwaitingSecond));
        assert!(!Merged.can_advance_to(Closing));
        assert!(!Empty.can_advance_to(Active));
        assert!(Merged.is_terminal() && Failed.is_terminal() && !Closing.is_terminal());
    }

    #[tokio::test]
    async fn test_lone_peer_session_is_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 8);
        let a = PeerId::new();

        sessions.open("r1", Slot::First, a, ANA).unwrap();
        assert_eq!(sessions.state_of("r1"), SessionState::AwaitingSecond);

        // chunks before activation go nowhere
        let disposition = sessions
            .write_chunk(Slot::First, a, &header("r1", 0), vec![1; 8])
            .unwrap();
        assert_eq!(disposition, ChunkDisposition::Dropped);

        assert!(matches!(sessions.close("r1").unwrap(), CloseOutcome::Discarded(_)));
        assert_eq!(sessions.state_of("r1"), SessionState::Empty);
        assert!(sessions.history().is_empty());
        assert_eq!(std::fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_activation_assigns_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 8);
        let (a, b) = (PeerId::new(), PeerId::new());

        let session_id = sessions.open("r1", Slot::First, a, ANA).unwrap();
        let (activated, dir) = sessions.activate("r1", Slot::Second, b, BO).unwrap();

        assert_eq!(activated, session_id);
        assert_eq!(sessions.state_of("r1"), SessionState::Active);
        assert_eq!(dir.path(), temp_dir.path().join("r1").join(session_id.to_string()));
        assert_eq!(sessions.session("r1").unwrap().dir(), Some(&dir));
        // activation itself does no disk I/O
        assert!(!dir.path().exists());

        assert_eq!(
            sessions.activate("r1", Slot::Second, b, BO).unwrap_err(),
            SessionError::NotAwaiting("r1".to_string())
        );
    }

    #[tokio::test]
    async fn test_close_happens_once() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 8);
        let (a, b) = (PeerId::new(), PeerId::new());
        sessions.open("r1", Slot::First, a, ANA).unwrap();
        sessions.activate("r1", Slot::Second, b, BO).unwrap();

        let CloseOutcome::Closing(ticket) = sessions.close("r1").unwrap() else {
            panic!("expected closing");
        };
        assert_eq!(
            ticket.participants,
            vec![(Slot::First, ANA.to_string()), (Slot::Second, BO.to_string())]
        );
        assert_eq!(sessions.state_of("r1"), SessionState::Closing);

        // the second departure of the same session is a no-op
        assert_eq!(
            sessions.close("r1").unwrap_err(),
            SessionError::AlreadyClosing("r1".to_string())
        );

        let output = ticket.dir.merged_output_path();
        let summary = sessions
            .finish_merge(ticket.session_id, &[], &Ok(output.clone()))
            .unwrap();
        assert_eq!(summary.state, SessionState::Merged);
        assert_eq!(summary.output, Some(output));
        assert_eq!(sessions.state_of("r1"), SessionState::Empty);
        assert!(matches!(sessions.close("r1").unwrap(), CloseOutcome::NoSession));

        // a finished session cannot be finished again
        assert!(sessions.finish_merge(ticket.session_id, &[], &Err(MergeError::NoInput)).is_none());
    }

    #[tokio::test]
    async fn test_chunks_land_in_slot_artifacts() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 8);
        let (a, b) = (PeerId::new(), PeerId::new());
        sessions.open("r1", Slot::First, a, ANA).unwrap();
        sessions.activate("r1", Slot::Second, b, BO).unwrap();

        for index in 0..2 {
            let disposition = sessions
                .write_chunk(Slot::First, a, &header("r1", index), vec![index as u8; 500])
                .unwrap();
            assert_eq!(disposition, ChunkDisposition::Queued);
        }
        // wrong slot for this peer
        assert_eq!(
            sessions
                .write_chunk(Slot::Second, a, &header("r1", 0), vec![0; 10])
                .unwrap(),
            ChunkDisposition::Dropped
        );

        let live = sessions.live();
        assert_eq!(live[0].participants[0].chunks, 2);
        assert_eq!(live[0].participants[0].bytes, 1000);

        let CloseOutcome::Closing(ticket) = sessions.close("r1").unwrap() else {
            panic!("expected closing");
        };
        assert_eq!(ticket.writers.len(), 1);
        let mut artifacts = Vec::new();
        for writer in ticket.writers {
            artifacts.push(writer.finish().await.unwrap());
        }
        assert_eq!(artifacts[0].bytes_written, 1000);
        assert_eq!(ticket.dir.artifacts().await.unwrap().len(), 1);
        assert!(artifacts[0]
            .path
            .to_string_lossy()
            .ends_with("first-ana@example.com.webm"));

        // chunks after close are dropped
        assert_eq!(
            sessions
                .write_chunk(Slot::First, a, &header("r1", 2), vec![2; 10])
                .unwrap(),
            ChunkDisposition::Dropped
        );

        let summary = sessions
            .finish_merge(ticket.session_id, &artifacts, &Err(MergeError::NoInput))
            .unwrap();
        assert_eq!(summary.state, SessionState::Failed);
        assert!(summary.failure.is_some());
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 2);

        for room in ["r1", "r2", "r3"] {
            sessions.open(room, Slot::First, PeerId::new(), ANA).unwrap();
            sessions.activate(room, Slot::Second, PeerId::new(), BO).unwrap();
            let CloseOutcome::Closing(ticket) = sessions.close(room).unwrap() else {
                panic!("expected closing");
            };
            sessions.finish_merge(ticket.session_id, &[], &Err(MergeError::NoInput));
        }

        let rooms: Vec<String> = sessions.history().into_iter().map(|s| s.room_id).collect();
        assert_eq!(rooms, vec!["r2".to_string(), "r3".to_string()]);
    }

    #[test]
    fn test_abandoned_session_is_forgotten() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 8);
        let a = PeerId::new();

        sessions.open("r1", Slot::First, a, ANA).unwrap();
        let (session_id, _) = sessions.activate("r1", Slot::Second, PeerId::new(), BO).unwrap();

        assert!(sessions.abandon(session_id, "disk full"));
        assert_eq!(sessions.state_of("r1"), SessionState::Empty);
        assert!(!sessions.abandon(session_id, "disk full"));
        assert_eq!(
            sessions
                .write_chunk(Slot::First, a, &header("r1", 0), vec![1; 8])
                .unwrap(),
            ChunkDisposition::Dropped
        );
        assert!(matches!(sessions.close("r1").unwrap(), CloseOutcome::NoSession));
        assert!(sessions.history().is_empty());
    }

    #[test]
    fn test_closed_room_can_start_a_new_session() {
        let temp_dir = TempDir::new().unwrap();
        let mut sessions = manager(&temp_dir, 8);
        let (b, c) = (PeerId::new(), PeerId::new());

        sessions.open("r1", Slot::First, PeerId::new(), ANA).unwrap();
        let (first, _) = sessions.activate("r1", Slot::Second, b, BO).unwrap();
        let CloseOutcome::Closing(_) = sessions.close("r1").unwrap() else {
            panic!("expected closing");
        };

        // the remaining member and a newcomer, while the first session is still merging
        let second = sessions.open("r1", Slot::Second, b, BO).unwrap();
        let (activated, dir) = sessions.activate("r1", Slot::First, c, "cy@example.com").unwrap();
        assert_eq!(activated, second);
        assert_ne!(first, second);
        assert_eq!(dir.path(), temp_dir.path().join("r1").join(second.to_string()));
        assert_eq!(sessions.state_of("r1"), SessionState::Active);
        assert_eq!(sessions.live().len(), 2);
    }
}
