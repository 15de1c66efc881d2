// ============================
// duet-backend-lib/src/writer.rs
// ============================
//! Ordered chunk persistence.
//!
//! Each (session, slot) gets one [`SlotWriter`]: a bounded command queue drained by a
//! single task that owns the artifact file. Because exactly one task appends, and it only
//! appends the next expected index, the file is always the concatenation of accepted
//! payloads in ascending `chunk_index` order no matter how chunks arrive.
//!
//! Chunks that arrive ahead of a missing index wait in a reorder buffer of at most
//! `reorder_window` entries. When the buffer overflows the writer gives up on the gap and
//! moves on; a chunk for an index that was skipped or already written is rejected. So is a
//! chunk further ahead of the next expected index than the queue and the reorder buffer
//! together could ever hold.
use crate::metrics::{CHUNK_BYTES, CHUNK_GAPS};
use crate::relay::Outbox;
use duet_common::{ChunkIndex, PeerId, ServerMessage, Slot};
use metrics::{counter, histogram};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    #[error("storage error: {0}")]
    Io(String),

    #[error("write queue is full, storage cannot keep up")]
    Backpressure,

    #[error("chunk {0} arrived after its position was already written")]
    Stale(ChunkIndex),

    #[error("chunk {0} was already received")]
    Duplicate(ChunkIndex),

    #[error("chunk {0} is too far ahead of the stream")]
    OutOfRange(ChunkIndex),

    #[error("writer is closed")]
    Closed,
}

/// Queue and reorder limits for one slot
#[derive(Debug, Clone, Copy)]
pub struct WriterConfig {
    pub queue_depth: usize,
    pub reorder_window: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            reorder_window: 8,
        }
    }
}

/// What a slot writer left on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotArtifact {
    pub slot: Slot,
    pub path: PathBuf,
    pub mime_type: String,
    pub chunks_written: u64,
    pub bytes_written: u64,
    /// Indices given up on because they never arrived
    pub skipped: u64,
    /// First storage failure, if any
    pub failure: Option<String>,
}

struct ChunkJob {
    index: ChunkIndex,
    bytes: Vec<u8>,
}

/// Sender side of a slot's write queue
pub struct SlotWriter {
    slot: Slot,
    path: PathBuf,
    tx: mpsc::Sender<ChunkJob>,
    task: JoinHandle<SlotArtifact>,
}

impl SlotWriter {
    /// Start the writer task. The file, and its directory if missing, is created on the
    /// first append.
    ///
    /// Asynchronous failures (I/O, stale or duplicate chunks) are reported to `peer_id`
    /// through `outbox` as `chunk-error`.
    pub fn spawn(
        slot: Slot,
        path: PathBuf,
        mime_type: String,
        peer_id: PeerId,
        outbox: Arc<dyn Outbox>,
        config: WriterConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth.max(1));
        let state = WriterTask {
            artifact: SlotArtifact {
                slot,
                path: path.clone(),
                mime_type,
                chunks_written: 0,
                bytes_written: 0,
                skipped: 0,
                failure: None,
            },
            file: None,
            next: 0,
            pending: BTreeMap::new(),
            reorder_window: config.reorder_window.max(1),
            max_ahead: (config.reorder_window.max(1) + config.queue_depth.max(1)) as u64,
            peer_id,
            outbox,
        };
        let task = tokio::spawn(state.run(rx));

        Self {
            slot,
            path,
            tx,
            task,
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Queue a chunk without waiting. A full queue is reported as backpressure rather
    /// than buffered.
    pub fn write(&self, index: ChunkIndex, bytes: Vec<u8>) -> Result<(), WriteError> {
        self.tx
            .try_send(ChunkJob { index, bytes })
            .map_err(|e| match e {
                TrySendError::Full(_) => WriteError::Backpressure,
                TrySendError::Closed(_) => WriteError::Closed,
            })
    }

    /// Close the queue, wait for every queued chunk to land and the file to be synced
    pub async fn finish(self) -> Result<SlotArtifact, WriteError> {
        drop(self.tx);
        self.task
            .await
            .map_err(|e| WriteError::Io(format!("writer task failed: {e}")))
    }
}

struct WriterTask {
    artifact: SlotArtifact,
    file: Option<File>,
    /// Lowest index not yet written or skipped
    next: ChunkIndex,
    pending: BTreeMap<ChunkIndex, Vec<u8>>,
    reorder_window: usize,
    /// Largest accepted distance between an incoming index and `next`
    max_ahead: u64,
    peer_id: PeerId,
    outbox: Arc<dyn Outbox>,
}

impl WriterTask {
    async fn run(mut self, mut rx: mpsc::Receiver<ChunkJob>) -> SlotArtifact {
        while let Some(job) = rx.recv().await {
            self.accept(job).await;
        }

        // queue closed: flush whatever is buffered, gaps and all
        while let Some((index, bytes)) = self.pending.pop_first() {
            if index > self.next {
                self.skip_to(index);
            }
            self.append(index, bytes).await;
        }
        self.sync().await;

        tracing::debug!(
            slot = %self.artifact.slot,
            path = %self.artifact.path.display(),
            chunks = self.artifact.chunks_written,
            bytes = self.artifact.bytes_written,
            "slot writer finished"
        );
        self.artifact
    }

    async fn accept(&mut self, job: ChunkJob) {
        if let Some(reason) = &self.artifact.failure {
            let err = WriteError::Io(reason.clone());
            self.report(job.index, &err);
            return;
        }
        if job.index < self.next {
            self.report(job.index, &WriteError::Stale(job.index));
            return;
        }
        if job.index - self.next > self.max_ahead {
            self.report(job.index, &WriteError::OutOfRange(job.index));
            return;
        }
        if self.pending.contains_key(&job.index) {
            self.report(job.index, &WriteError::Duplicate(job.index));
            return;
        }

        self.pending.insert(job.index, job.bytes);
        self.drain_ready().await;

        if self.pending.len() > self.reorder_window {
            if let Some(&lowest) = self.pending.keys().next() {
                tracing::warn!(
                    slot = %self.artifact.slot,
                    missing_from = self.next,
                    resume_at = lowest,
                    "chunk never arrived, skipping gap"
                );
                self.skip_to(lowest);
                self.drain_ready().await;
            }
        }
    }

    async fn drain_ready(&mut self) {
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() != self.next {
                break;
            }
            let (index, bytes) = entry.remove_entry();
            self.append(index, bytes).await;
        }
    }

    fn skip_to(&mut self, index: ChunkIndex) {
        let skipped = index - self.next;
        self.artifact.skipped += skipped;
        counter!(CHUNK_GAPS).increment(skipped);
        self.next = index;
    }

    async fn append(&mut self, index: ChunkIndex, bytes: Vec<u8>) {
        let Some(next) = index.checked_add(1) else {
            self.report(index, &WriteError::OutOfRange(index));
            return;
        };
        self.next = next;
        if self.artifact.failure.is_some() {
            let err = WriteError::Io(self.artifact.failure.clone().unwrap_or_default());
            self.report(index, &err);
            return;
        }

        match self.append_bytes(&bytes).await {
            Ok(()) => {
                self.artifact.chunks_written += 1;
                self.artifact.bytes_written += bytes.len() as u64;
                histogram!(CHUNK_BYTES).record(bytes.len() as f64);
            },
            Err(e) => {
                tracing::error!(
                    slot = %self.artifact.slot,
                    path = %self.artifact.path.display(),
                    chunk_index = index,
                    error = %e,
                    "failed to persist chunk"
                );
                let reason = e.to_string();
                self.artifact.failure = Some(reason.clone());
                self.report(index, &WriteError::Io(reason));
            },
        }
    }

    async fn append_bytes(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent) = self.artifact.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.artifact.path)
                    .await?
            },
        };
        let file = self.file.insert(file);
        file.write_all(bytes).await?;
        file.flush().await
    }

    async fn sync(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all().await {
                tracing::warn!(path = %self.artifact.path.display(), error = %e, "fsync failed");
            }
        }
    }

    fn report(&self, index: ChunkIndex, err: &WriteError) {
        tracing::warn!(slot = %self.artifact.slot, chunk_index = index, error = %err, "chunk rejected");
        self.outbox.unicast(
            self.peer_id,
            ServerMessage::ChunkError {
                error: err.to_string(),
                chunk_index: Some(index),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::PeerHub;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn chunk(fill: u8, len: usize) -> Vec<u8> {
        vec![fill; len]
    }

    fn spawn_writer(
        temp_dir: &TempDir,
        config: WriterConfig,
    ) -> (SlotWriter, tokio::sync::mpsc::UnboundedReceiver<ServerMessage>) {
        let hub = Arc::new(PeerHub::new());
        let peer = PeerId::new();
        let rx = hub.subscribe(peer);
        let writer = SlotWriter::spawn(
            Slot::First,
            temp_dir.path().join("first-ana@example.com.webm"),
            "video/webm".to_string(),
            peer,
            hub,
            config,
        );
        (writer, rx)
    }

    #[tokio::test]
    async fn test_in_order_chunks_concatenate() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, _rx) = spawn_writer(&temp_dir, WriterConfig::default());

        writer.write(0, chunk(0xA0, 500)).unwrap();
        writer.write(1, chunk(0xA1, 500)).unwrap();
        let artifact = writer.finish().await.unwrap();

        let written = tokio::fs::read(&artifact.path).await.unwrap();
        assert_eq!(written.len(), 1000);
        assert_eq!(written, [chunk(0xA0, 500), chunk(0xA1, 500)].concat());
        assert_eq!(artifact.chunks_written, 2);
        assert_eq!(artifact.bytes_written, 1000);
        assert_eq!(artifact.skipped, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_arrivals_are_written_in_index_order() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, mut rx) = spawn_writer(&temp_dir, WriterConfig::default());

        for index in [3u64, 1, 0, 4, 2] {
            writer.write(index, chunk(index as u8, 10 + index as usize)).unwrap();
        }
        let artifact = writer.finish().await.unwrap();

        let expected: Vec<u8> = (0u64..5)
            .flat_map(|i| chunk(i as u8, 10 + i as usize))
            .collect();
        assert_eq!(tokio::fs::read(&artifact.path).await.unwrap(), expected);
        assert!(rx.try_recv().is_err(), "no errors expected");
    }

    /// Shuffled `0..n` with every permutation fitting the default reorder window
    fn arb_arrival_order() -> impl Strategy<Value = Vec<u64>> {
        let window = WriterConfig::default().reorder_window as u64;
        (1..=window + 1).prop_flat_map(|n| Just((0..n).collect::<Vec<u64>>()).prop_shuffle())
    }

    proptest! {
        #[test]
        fn arrival_order_never_changes_the_artifact(order in arb_arrival_order()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (written, artifact, errors) = runtime.block_on(async {
                let temp_dir = TempDir::new().unwrap();
                let (writer, mut rx) = spawn_writer(&temp_dir, WriterConfig::default());
                for &index in &order {
                    writer.write(index, chunk(index as u8, 3 + index as usize)).unwrap();
                }
                let artifact = writer.finish().await.unwrap();
                let written = tokio::fs::read(&artifact.path).await.unwrap();
                let mut errors = 0;
                while rx.try_recv().is_ok() {
                    errors += 1;
                }
                (written, artifact, errors)
            });

            let expected: Vec<u8> = (0..order.len() as u64)
                .flat_map(|i| chunk(i as u8, 3 + i as usize))
                .collect();
            prop_assert_eq!(written, expected);
            prop_assert_eq!(artifact.chunks_written, order.len() as u64);
            prop_assert_eq!(artifact.skipped, 0);
            prop_assert_eq!(errors, 0);
        }
    }

    #[tokio::test]
    async fn test_stale_and_duplicate_chunks_are_reported() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, mut rx) = spawn_writer(&temp_dir, WriterConfig::default());

        writer.write(0, chunk(1, 4)).unwrap();
        writer.write(2, chunk(3, 4)).unwrap();
        writer.write(2, chunk(9, 4)).unwrap();
        writer.write(0, chunk(9, 4)).unwrap();
        writer.write(1, chunk(2, 4)).unwrap();
        let artifact = writer.finish().await.unwrap();

        assert_eq!(
            tokio::fs::read(&artifact.path).await.unwrap(),
            [chunk(1, 4), chunk(2, 4), chunk(3, 4)].concat()
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::ChunkError {
                error: WriteError::Duplicate(2).to_string(),
                chunk_index: Some(2),
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::ChunkError {
                error: WriteError::Stale(0).to_string(),
                chunk_index: Some(0),
            }
        );
    }

    #[tokio::test]
    async fn test_gap_is_skipped_when_reorder_window_overflows() {
        let temp_dir = TempDir::new().unwrap();
        let config = WriterConfig {
            queue_depth: 16,
            reorder_window: 2,
        };
        let (writer, mut rx) = spawn_writer(&temp_dir, config);

        // index 0 never arrives
        for index in 1u64..=3 {
            writer.write(index, chunk(index as u8, 2)).unwrap();
        }
        // arrives too late
        writer.write(0, chunk(0, 2)).unwrap();
        let artifact = writer.finish().await.unwrap();

        assert_eq!(artifact.skipped, 1);
        assert_eq!(
            tokio::fs::read(&artifact.path).await.unwrap(),
            [chunk(1, 2), chunk(2, 2), chunk(3, 2)].concat()
        );
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::ChunkError { chunk_index: Some(0), .. }
        ));
    }

    #[tokio::test]
    async fn test_last_representable_index_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, mut rx) = spawn_writer(&temp_dir, WriterConfig::default());

        writer.write(0, chunk(0, 4)).unwrap();
        writer.write(u64::MAX, chunk(9, 4)).unwrap();
        writer.write(1, chunk(1, 4)).unwrap();
        let artifact = writer.finish().await.unwrap();

        assert_eq!(
            tokio::fs::read(&artifact.path).await.unwrap(),
            [chunk(0, 4), chunk(1, 4)].concat()
        );
        assert_eq!(artifact.skipped, 0);
        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::ChunkError {
                error: WriteError::OutOfRange(u64::MAX).to_string(),
                chunk_index: Some(u64::MAX),
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_far_ahead_index_does_not_skip_the_stream() {
        let temp_dir = TempDir::new().unwrap();
        let config = WriterConfig {
            queue_depth: 4,
            reorder_window: 2,
        };
        let (writer, mut rx) = spawn_writer(&temp_dir, config);

        writer.write(0, chunk(0, 2)).unwrap();
        writer.write(100, chunk(7, 2)).unwrap();
        writer.write(1, chunk(1, 2)).unwrap();
        writer.write(2, chunk(2, 2)).unwrap();
        let artifact = writer.finish().await.unwrap();

        assert_eq!(
            tokio::fs::read(&artifact.path).await.unwrap(),
            [chunk(0, 2), chunk(1, 2), chunk(2, 2)].concat()
        );
        assert_eq!(artifact.skipped, 0);
        assert_eq!(artifact.chunks_written, 3);
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::ChunkError { chunk_index: Some(100), .. }
        ));
    }

    #[tokio::test]
    async fn test_finish_flushes_buffered_chunks_across_gaps() {
        let temp_dir = TempDir::new().unwrap();
        let (writer, _rx) = spawn_writer(&temp_dir, WriterConfig::default());

        writer.write(5, chunk(5, 3)).unwrap();
        writer.write(2, chunk(2, 3)).unwrap();
        let artifact = writer.finish().await.unwrap();

        assert_eq!(
            tokio::fs::read(&artifact.path).await.unwrap(),
            [chunk(2, 3), chunk(5, 3)].concat()
        );
        assert_eq!(artifact.skipped, 4);
    }

    #[tokio::test]
    async fn test_full_queue_signals_backpressure() {
        let temp_dir = TempDir::new().unwrap();
        let config = WriterConfig {
            queue_depth: 1,
            reorder_window: 4,
        };
        let (writer, _rx) = spawn_writer(&temp_dir, config);

        // the current-thread test runtime does not run the writer task until we yield
        writer.write(0, chunk(0, 8)).unwrap();
        assert_eq!(writer.write(1, chunk(1, 8)), Err(WriteError::Backpressure));

        let artifact = writer.finish().await.unwrap();
        assert_eq!(artifact.chunks_written, 1);
    }

    #[tokio::test]
    async fn test_io_failure_poisons_slot() {
        let temp_dir = TempDir::new().unwrap();
        let hub = Arc::new(PeerHub::new());
        let peer = PeerId::new();
        let mut rx = hub.subscribe(peer);
        // a directory squatting on the artifact path
        let path = temp_dir.path().join("second-bo@example.com.webm");
        std::fs::create_dir(&path).unwrap();
        let writer = SlotWriter::spawn(
            Slot::Second,
            path,
            "video/webm".to_string(),
            peer,
            hub,
            WriterConfig::default(),
        );

        writer.write(0, chunk(0, 4)).unwrap();
        writer.write(1, chunk(1, 4)).unwrap();
        let artifact = writer.finish().await.unwrap();

        assert!(artifact.failure.is_some());
        assert_eq!(artifact.chunks_written, 0);
        for expected in [0u64, 1] {
            match rx.recv().await.unwrap() {
                ServerMessage::ChunkError { chunk_index, error } => {
                    assert_eq!(chunk_index, Some(expected));
                    assert!(error.starts_with("storage error"));
                },
                other => panic!("unexpected message {other:?}"),
            }
        }
    }
}
