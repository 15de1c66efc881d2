// ============================
// duet-backend-lib/src/merge.rs
// ============================
//! Merge pipeline: turn a closed session's per-slot artifacts into one recording.
//!
//! Two artifacts are composited side by side in a fixed frame box with their audio mixed
//! and trimmed to the shorter input; a single artifact is re-encoded alone so every session
//! ends up with the same codec and container. Sources are deleted only after the output
//! has been renamed into place.
use crate::config::MergeSettings;
use crate::metrics::{MERGE_DURATION_SECS, MERGE_FAILED, MERGE_SUCCEEDED};
use crate::storage::SessionDir;
use async_trait::async_trait;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::process::Command;

/// Lines of transcoder stderr kept in a failure message
const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum MergeError {
    #[error("no recorded media to merge")]
    NoInput,

    #[error("transcoding failed: {0}")]
    TranscodeFailure(String),

    #[error("a merge is already running for {0}")]
    AlreadyRunning(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Spatial arrangement of the output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Composition {
    Single,
    SideBySide,
}

/// One transcoder invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeJob {
    pub source_dir: PathBuf,
    /// Ordered first slot, then second
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub composition: Composition,
}

/// External transcoding process
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Produce `job.output` from `job.inputs`
    async fn transcode(&self, job: &MergeJob) -> Result<(), MergeError>;
}

/// Runs `ffmpeg` as a child process
pub struct FfmpegTranscoder {
    settings: MergeSettings,
}

impl FfmpegTranscoder {
    pub fn new(settings: MergeSettings) -> Self {
        Self { settings }
    }

    /// Scale into the frame box preserving aspect ratio, pad the rest black
    fn fit_filter(&self) -> String {
        let (w, h) = (self.settings.frame_width, self.settings.frame_height);
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:black,setsar=1"
        )
    }

    /// Command-line arguments for a job
    pub fn build_args(&self, job: &MergeJob) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();

        for input in &job.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().into_owned());
        }

        match job.composition {
            Composition::Single => {
                args.extend(["-vf".to_string(), self.fit_filter()]);
            },
            Composition::SideBySide => {
                let fit = self.fit_filter();
                args.extend([
                    "-filter_complex".to_string(),
                    format!(
                        "[0:v]{fit}[left];[1:v]{fit}[right];\
                         [left][right]hstack=inputs=2:shortest=1[v];\
                         [0:a][1:a]amix=inputs=2:duration=shortest[a]"
                    ),
                    "-map".to_string(),
                    "[v]".to_string(),
                    "-map".to_string(),
                    "[a]".to_string(),
                    "-shortest".to_string(),
                ]);
            },
        }

        args.extend([
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            self.settings.preset.clone(),
            "-crf".to_string(),
            self.settings.crf.to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            self.settings.audio_bitrate.clone(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            "-f".to_string(),
            "mp4".to_string(),
        ]);
        args.push(job.output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, job: &MergeJob) -> Result<(), MergeError> {
        let args = self.build_args(job);
        tracing::info!(
            ffmpeg = %self.settings.ffmpeg_path.display(),
            inputs = job.inputs.len(),
            output = %job.output.display(),
            "starting transcoder"
        );
        tracing::debug!(?args, "transcoder arguments");

        let output = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| MergeError::TranscodeFailure(format!("failed to start ffmpeg: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
            return Err(MergeError::TranscodeFailure(format!(
                "ffmpeg exited with {}: {tail}",
                output.status
            )));
        }

        Ok(())
    }
}

/// Discovers artifacts, runs the transcoder, and reclaims sources
pub struct MergePipeline {
    transcoder: Arc<dyn Transcoder>,
    in_flight: Arc<Mutex<HashSet<PathBuf>>>,
}

/// Holds a directory's in-flight slot until dropped
struct InFlight {
    dir: PathBuf,
    set: Arc<Mutex<HashSet<PathBuf>>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.lock().remove(&self.dir);
    }
}

impl MergePipeline {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self {
            transcoder,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, dir: &Path) -> Result<InFlight, MergeError> {
        let mut set = self.in_flight.lock();
        if !set.insert(dir.to_path_buf()) {
            return Err(MergeError::AlreadyRunning(dir.to_path_buf()));
        }
        Ok(InFlight {
            dir: dir.to_path_buf(),
            set: self.in_flight.clone(),
        })
    }

    /// Merge a session directory, returning the path of the composite recording.
    ///
    /// On any failure the per-slot artifacts are left exactly as they were.
    pub async fn merge(&self, dir: &SessionDir) -> Result<PathBuf, MergeError> {
        let _claim = self.claim(dir.path())?;
        let started = Instant::now();

        let result = self.run(dir).await;
        histogram!(MERGE_DURATION_SECS).record(started.elapsed().as_secs_f64());
        match &result {
            Ok(output) => {
                counter!(MERGE_SUCCEEDED).increment(1);
                tracing::info!(
                    dir = %dir.path().display(),
                    output = %output.display(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "merge complete"
                );
            },
            Err(e) => {
                counter!(MERGE_FAILED).increment(1);
                tracing::error!(
                    dir = %dir.path().display(),
                    error = %e,
                    "merge failed, sources kept for manual recovery"
                );
            },
        }
        result
    }

    async fn run(&self, dir: &SessionDir) -> Result<PathBuf, MergeError> {
        let inputs = dir.artifacts().await?;
        let composition = match inputs.len() {
            0 => return Err(MergeError::NoInput),
            1 => Composition::Single,
            _ => Composition::SideBySide,
        };

        let job = MergeJob {
            source_dir: dir.path().to_path_buf(),
            inputs,
            output: dir.partial_output_path(),
            composition,
        };

        if let Err(e) = self.transcoder.transcode(&job).await {
            remove_if_present(&job.output).await;
            return Err(e);
        }

        if !tokio::fs::try_exists(&job.output).await.unwrap_or(false) {
            return Err(MergeError::TranscodeFailure(
                "transcoder reported success but wrote no output".to_string(),
            ));
        }

        let merged = dir.merged_output_path();
        tokio::fs::rename(&job.output, &merged).await?;

        for source in &job.inputs {
            if let Err(e) = tokio::fs::remove_file(source).await {
                tracing::warn!(path = %source.display(), error = %e, "could not remove merged source");
            }
        }

        Ok(merged)
    }
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {},
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "could not remove partial output"),
    }
}
