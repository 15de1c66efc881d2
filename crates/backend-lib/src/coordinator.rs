// ============================
// duet-backend-lib/src/coordinator.rs
// ============================
//! The dispatch loop.
//!
//! A single task owns the [`RoomRegistry`] and the [`SessionManager`] and processes
//! connection and message events one at a time, so neither needs locking. Session
//! directories are created, chunks appended and sessions merged on spawned tasks; the loop
//! never waits on disk.
use crate::catalog::{CompletedRecording, RecordingCatalog};
use crate::config::Settings;
use crate::error::AppError;
use crate::merge::{MergeError, MergePipeline, Transcoder};
use crate::metrics::{ROOMS_ACTIVE, ROOM_JOINED, ROOM_REJECTED_FULL};
use crate::registry::{Departure, JoinOutcome, RegistryError, RoomRegistry, RoomSummary};
use crate::relay::{NegotiationRelay, Outbox};
use crate::session::{CloseOutcome, CloseTicket, SessionError, SessionManager, SessionSummary};
use crate::storage::Storage;
use crate::writer::{SlotArtifact, WriterConfig};
use chrono::Utc;
use duet_common::{ChunkHeader, NegotiationKind, PeerId, ServerMessage, Slot};
use metrics::{counter, gauge};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent *into* the coordinator
#[derive(Debug)]
pub enum CoordinatorMsg {
    Connect {
        peer_id: PeerId,
    },
    Disconnect {
        peer_id: PeerId,
    },
    Join {
        peer_id: PeerId,
        room_id: String,
        identity: String,
    },
    Relay {
        kind: NegotiationKind,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    },
    Chunk {
        peer_id: PeerId,
        header: ChunkHeader,
        payload: Vec<u8>,
    },
    Leave {
        peer_id: PeerId,
        room_id: String,
    },
    StorageFailed {
        session_id: Uuid,
        room_id: String,
        error: String,
    },
    MergeFinished {
        session_id: Uuid,
        artifacts: Vec<SlotArtifact>,
        result: Result<PathBuf, MergeError>,
    },
    Snapshot {
        resp_tx: oneshot::Sender<SessionSnapshot>,
    },
}

/// Rooms and sessions as seen by the coordinator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub peers: usize,
    pub rooms: Vec<RoomSummary>,
    /// Sessions not yet merged or failed
    pub sessions: Vec<SessionSummary>,
    /// Finished sessions, oldest first
    pub history: Vec<SessionSummary>,
}

/// Collaborators the coordinator reaches out to
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub storage: Arc<dyn Storage>,
    pub outbox: Arc<dyn Outbox>,
    pub transcoder: Arc<dyn Transcoder>,
    pub catalog: Arc<dyn RecordingCatalog>,
}

/// Handle that other components keep
#[derive(Clone)]
pub struct CoordinatorHandle {
    cmd_tx: mpsc::UnboundedSender<CoordinatorMsg>,
}

impl CoordinatorHandle {
    pub fn connect(&self, peer_id: PeerId) -> Result<(), AppError> {
        self.cmd_tx.send(CoordinatorMsg::Connect { peer_id })?;
        Ok(())
    }

    pub fn disconnect(&self, peer_id: PeerId) -> Result<(), AppError> {
        self.cmd_tx.send(CoordinatorMsg::Disconnect { peer_id })?;
        Ok(())
    }

    /// `identity` must already be verified
    pub fn join(&self, peer_id: PeerId, room_id: String, identity: String) -> Result<(), AppError> {
        self.cmd_tx.send(CoordinatorMsg::Join {
            peer_id,
            room_id,
            identity,
        })?;
        Ok(())
    }

    pub fn relay(
        &self,
        kind: NegotiationKind,
        from: PeerId,
        to: PeerId,
        payload: serde_json::Value,
    ) -> Result<(), AppError> {
        self.cmd_tx.send(CoordinatorMsg::Relay {
            kind,
            from,
            to,
            payload,
        })?;
        Ok(())
    }

    pub fn chunk(
        &self,
        peer_id: PeerId,
        header: ChunkHeader,
        payload: Vec<u8>,
    ) -> Result<(), AppError> {
        self.cmd_tx.send(CoordinatorMsg::Chunk {
            peer_id,
            header,
            payload,
        })?;
        Ok(())
    }

    pub fn leave(&self, peer_id: PeerId, room_id: String) -> Result<(), AppError> {
        self.cmd_tx.send(CoordinatorMsg::Leave { peer_id, room_id })?;
        Ok(())
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx.send(CoordinatorMsg::Snapshot { resp_tx })?;
        Ok(resp_rx.await?)
    }
}

pub struct Coordinator {
    registry: RoomRegistry,
    sessions: SessionManager,
    relay: NegotiationRelay,
    outbox: Arc<dyn Outbox>,
    storage: Arc<dyn Storage>,
    pipeline: Arc<MergePipeline>,
    catalog: Arc<dyn RecordingCatalog>,
    /// Merge tasks report back through this; weak so the loop ends once every handle is gone
    self_tx: mpsc::WeakUnboundedSender<CoordinatorMsg>,
}

impl Coordinator {
    fn new(
        settings: &Settings,
        deps: CoordinatorDeps,
        self_tx: mpsc::WeakUnboundedSender<CoordinatorMsg>,
    ) -> Self {
        let writer_config = WriterConfig {
            queue_depth: settings.recording.chunk_queue_depth,
            reorder_window: settings.recording.reorder_window,
        };
        Self {
            registry: RoomRegistry::new(),
            sessions: SessionManager::new(
                deps.storage.clone(),
                deps.outbox.clone(),
                writer_config,
                settings.session_history,
            ),
            relay: NegotiationRelay::new(deps.outbox.clone()),
            outbox: deps.outbox,
            storage: deps.storage,
            pipeline: Arc::new(MergePipeline::new(deps.transcoder)),
            catalog: deps.catalog,
            self_tx,
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<CoordinatorMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                CoordinatorMsg::Connect { peer_id } => self.registry.connect(peer_id),
                CoordinatorMsg::Disconnect { peer_id } => {
                    if let Some(departure) = self.registry.disconnect(peer_id) {
                        self.depart(departure);
                    }
                },
                CoordinatorMsg::Join {
                    peer_id,
                    room_id,
                    identity,
                } => self.handle_join(peer_id, room_id, identity),
                CoordinatorMsg::Relay {
                    kind,
                    from,
                    to,
                    payload,
                } => {
                    self.relay.relay(kind, from, to, payload);
                },
                CoordinatorMsg::Chunk {
                    peer_id,
                    header,
                    payload,
                } => self.handle_chunk(peer_id, header, payload),
                CoordinatorMsg::Leave { peer_id, room_id } => self.handle_leave(peer_id, &room_id),
                CoordinatorMsg::StorageFailed {
                    session_id,
                    room_id,
                    error,
                } => self.handle_storage_failure(session_id, &room_id, error),
                CoordinatorMsg::MergeFinished {
                    session_id,
                    artifacts,
                    result,
                } => {
                    self.sessions.finish_merge(session_id, &artifacts, &result);
                },
                CoordinatorMsg::Snapshot { resp_tx } => {
                    let _ = resp_tx.send(self.snapshot());
                },
            }
        }
        tracing::info!("coordinator stopped");
    }

    fn handle_join(&mut self, peer_id: PeerId, room_id: String, identity: String) {
        let JoinOutcome { slot, others } = match self.registry.join(&room_id, peer_id, &identity) {
            Ok(outcome) => outcome,
            Err(RegistryError::RoomFull(_)) => {
                counter!(ROOM_REJECTED_FULL).increment(1);
                tracing::info!(%peer_id, room_id, "room full, join rejected");
                self.outbox.unicast(peer_id, ServerMessage::RoomFull);
                return;
            },
            Err(e) => {
                tracing::warn!(%peer_id, room_id, error = %e, "join rejected");
                self.outbox
                    .unicast(peer_id, AppError::from(e).to_server_message());
                return;
            },
        };

        counter!(ROOM_JOINED).increment(1);
        gauge!(ROOMS_ACTIVE).set(self.registry.room_count() as f64);
        tracing::info!(%peer_id, room_id, %slot, "peer joined room");

        let other_ids: Vec<PeerId> = others.iter().map(|peer| peer.peer_id).collect();
        let remaining = others.first().cloned();
        self.outbox.unicast(
            peer_id,
            ServerMessage::Joined {
                room_id: room_id.clone(),
                peer_id,
                slot,
                peers: others,
            },
        );
        self.outbox.broadcast(
            &other_ids,
            &ServerMessage::PeerJoined {
                peer_id,
                identity: identity.clone(),
            },
        );

        let Some(remaining) = remaining else {
            if let Err(e) = self.sessions.open(&room_id, slot, peer_id, &identity) {
                tracing::error!(room_id, error = %e, "could not open recording session");
            }
            return;
        };

        // the room's earlier session already closed; the pair starts a new one
        if self.sessions.session(&room_id).is_none() {
            if let Err(e) = self.sessions.open(
                &room_id,
                remaining.slot,
                remaining.peer_id,
                &remaining.identity,
            ) {
                tracing::error!(room_id, error = %e, "could not reopen recording session");
                return;
            }
        }

        match self.sessions.activate(&room_id, slot, peer_id, &identity) {
            Ok((session_id, _)) => self.spawn_prepare(session_id, room_id),
            Err(e) => tracing::error!(room_id, error = %e, "could not activate recording session"),
        }
    }

    /// Create the session directory off the loop; only a failure is reported back
    fn spawn_prepare(&self, session_id: Uuid, room_id: String) {
        let storage = self.storage.clone();
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            match storage.create_session_dir(&room_id, session_id).await {
                Ok(dir) => {
                    tracing::debug!(%session_id, dir = %dir.path().display(), "session directory ready");
                },
                Err(e) => {
                    let failed = CoordinatorMsg::StorageFailed {
                        session_id,
                        room_id,
                        error: e.to_string(),
                    };
                    if let Some(tx) = self_tx.upgrade() {
                        let _ = tx.send(failed);
                    }
                },
            }
        });
    }

    /// The call goes on; both members learn that it is not being recorded
    fn handle_storage_failure(&mut self, session_id: Uuid, room_id: &str, error: String) {
        if !self.sessions.abandon(session_id, &error) {
            // already closed, the merge reports the failure
            return;
        }
        let members: Vec<PeerId> = self
            .registry
            .members(room_id)
            .into_iter()
            .map(|peer| peer.peer_id)
            .collect();
        let msg = AppError::from(SessionError::Storage(error)).to_server_message();
        self.outbox.broadcast(&members, &msg);
    }

    fn handle_chunk(&mut self, peer_id: PeerId, header: ChunkHeader, payload: Vec<u8>) {
        let slot = self
            .registry
            .peer(peer_id)
            .filter(|peer| peer.room_id.as_deref() == Some(header.room_id.as_str()))
            .and_then(|peer| peer.slot);
        let Some(slot) = slot else {
            tracing::debug!(%peer_id, room_id = %header.room_id, "chunk for a room the peer is not in");
            return;
        };

        let chunk_index = header.chunk_index;
        if let Err(e) = self.sessions.write_chunk(slot, peer_id, &header, payload) {
            tracing::warn!(%peer_id, %slot, chunk_index, error = %e, "chunk not queued");
            self.outbox.unicast(
                peer_id,
                ServerMessage::ChunkError {
                    error: e.to_string(),
                    chunk_index: Some(chunk_index),
                },
            );
        }
    }

    fn handle_leave(&mut self, peer_id: PeerId, room_id: &str) {
        let in_room = self
            .registry
            .peer(peer_id)
            .and_then(|peer| peer.room_id.as_deref())
            == Some(room_id);
        if !in_room {
            tracing::debug!(%peer_id, room_id, "leave for a room the peer is not in");
            return;
        }
        if let Some(departure) = self.registry.leave(peer_id) {
            self.depart(departure);
        }
    }

    /// Tell the rest of the room, then close the room's session
    fn depart(&mut self, departure: Departure) {
        gauge!(ROOMS_ACTIVE).set(self.registry.room_count() as f64);
        tracing::info!(
            peer_id = %departure.peer_id,
            room_id = %departure.room_id,
            slot = %departure.slot,
            "peer left room"
        );
        self.outbox.broadcast(
            &departure.remaining,
            &ServerMessage::PeerLeft {
                peer_id: departure.peer_id,
                identity: departure.identity.clone(),
            },
        );

        match self.sessions.close(&departure.room_id) {
            Ok(CloseOutcome::Closing(ticket)) => self.spawn_merge(ticket),
            Ok(CloseOutcome::Discarded(_) | CloseOutcome::NoSession) => {},
            Err(SessionError::AlreadyClosing(room_id)) => {
                tracing::debug!(room_id, "session already closing");
            },
            Err(e) => {
                tracing::error!(room_id = %departure.room_id, error = %e, "could not close session");
            },
        }
    }

    /// Drain the slot writers, merge, and report back to the loop
    fn spawn_merge(&self, ticket: CloseTicket) {
        let pipeline = self.pipeline.clone();
        let catalog = self.catalog.clone();
        let self_tx = self.self_tx.clone();

        tokio::spawn(async move {
            let CloseTicket {
                session_id,
                room_id,
                dir,
                writers,
                participants,
            } = ticket;

            let mut artifacts = Vec::with_capacity(writers.len());
            for writer in writers {
                let slot: Slot = writer.slot();
                match writer.finish().await {
                    Ok(artifact) => artifacts.push(artifact),
                    Err(e) => tracing::error!(%session_id, %slot, error = %e, "slot writer lost"),
                }
            }

            let result = pipeline.merge(&dir).await;
            if let Ok(output) = &result {
                catalog
                    .recording_completed(CompletedRecording {
                        session_id,
                        room_id,
                        participants,
                        output: output.clone(),
                        completed_at: Utc::now(),
                    })
                    .await;
            }

            let finished = CoordinatorMsg::MergeFinished {
                session_id,
                artifacts,
                result,
            };
            match self_tx.upgrade() {
                Some(tx) => {
                    let _ = tx.send(finished);
                },
                None => tracing::warn!(%session_id, "coordinator gone before merge finished"),
            }
        });
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peers: self.registry.peer_count(),
            rooms: self.registry.rooms(),
            sessions: self.sessions.live(),
            history: self.sessions.history(),
        }
    }
}

/// Spawn the coordinator and return its handle
pub fn spawn_coordinator(settings: &Settings, deps: CoordinatorDeps) -> CoordinatorHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let coordinator = Coordinator::new(settings, deps, cmd_tx.downgrade());

    tokio::spawn(async move {
        coordinator.run(cmd_rx).await;
    });

    CoordinatorHandle { cmd_tx }
}
