// ============================
// duet-backend-lib/src/config.rs
// ============================
//! Configuration management.
//!
//! Settings are layered: built-in defaults, then a TOML file, then `DUET_`-prefixed
//! environment variables (`__` separates nested keys, e.g. `DUET_MERGE__CRF=20`).
use crate::error::AppError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Config file read by [`Settings::load`]
pub const DEFAULT_CONFIG_FILE: &str = "duet.toml";
/// Environment variable prefix
pub const ENV_PREFIX: &str = "DUET_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Root directory for session recordings
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Number of closed sessions kept for `/sessions`
    pub session_history: usize,
    /// Chunk persistence limits
    pub recording: RecordingSettings,
    /// Composite recording output
    pub merge: MergeSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Per-slot chunk writer limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    /// Chunks that may wait in a slot's write queue before senders get backpressure
    pub chunk_queue_depth: usize,
    /// Out-of-order chunks held while waiting for a missing index
    pub reorder_window: usize,
    /// Largest accepted chunk payload in bytes
    pub max_chunk_bytes: usize,
}

/// Transcoder invocation for the merged recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeSettings {
    pub ffmpeg_path: PathBuf,
    /// Frame box each participant is scaled into
    pub frame_width: u32,
    pub frame_height: u32,
    pub preset: String,
    pub crf: u8,
    pub audio_bitrate: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            data_dir: PathBuf::from("recordings"),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            session_history: 64,
            recording: RecordingSettings::default(),
            merge: MergeSettings::default(),
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            chunk_queue_depth: 32,
            reorder_window: 8,
            // 10s slices at ~1.6 Mbit/s are ~2 MiB; leave headroom for higher bitrates
            max_chunk_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            frame_width: 640,
            frame_height: 480,
            preset: "veryfast".to_string(),
            crf: 23,
            audio_bitrate: "128k".to_string(),
        }
    }
}

impl Settings {
    /// Load from `duet.toml` in the working directory (if present) and the environment
    pub fn load() -> Result<Self, AppError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from an explicit TOML file and the environment. A missing file is not an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let settings: Settings = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(AppError::Config(format!(
                "log_level must be one of {LOG_LEVELS:?}, got {:?}",
                self.log_level
            )));
        }
        if self.recording.chunk_queue_depth == 0 {
            return Err(AppError::Config("recording.chunk_queue_depth must be > 0".into()));
        }
        if self.recording.reorder_window == 0 {
            return Err(AppError::Config("recording.reorder_window must be > 0".into()));
        }
        if self.recording.max_chunk_bytes == 0 {
            return Err(AppError::Config("recording.max_chunk_bytes must be > 0".into()));
        }
        // yuv420p needs even dimensions
        let (w, h) = (self.merge.frame_width, self.merge.frame_height);
        if w == 0 || h == 0 || w % 2 != 0 || h % 2 != 0 {
            return Err(AppError::Config(format!(
                "merge frame must have even, non-zero dimensions, got {w}x{h}"
            )));
        }
        if self.merge.crf > 51 {
            return Err(AppError::Config(format!(
                "merge.crf must be within 0..=51, got {}",
                self.merge.crf
            )));
        }
        if self.merge.preset.trim().is_empty() || self.merge.audio_bitrate.trim().is_empty() {
            return Err(AppError::Config(
                "merge.preset and merge.audio_bitrate must not be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod config_tests;
