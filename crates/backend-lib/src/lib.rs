// ============================
// duet-backend-lib/src/lib.rs
// ============================
//! Core of the duet server: two-party rooms, negotiation relay, per-slot recording and the
//! merge into one composite recording.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod session;
pub mod storage;
pub mod validation;
pub mod websocket;
pub mod writer;
pub mod ws_router;

use crate::auth::{AuthService, ClaimedIdentityAuth};
use crate::catalog::{RecordingCatalog, TracingCatalog};
use crate::config::Settings;
use crate::coordinator::{spawn_coordinator, CoordinatorDeps, CoordinatorHandle};
use crate::error::AppError;
use crate::merge::{FfmpegTranscoder, Transcoder};
use crate::relay::PeerHub;
use crate::storage::{FlatFileStorage, Storage};
use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Identity check for joining peers
    pub auth: Arc<dyn AuthService>,
    /// Outbound channel of every connected peer
    pub hub: Arc<PeerHub>,
    /// Dispatch loop owning rooms and sessions
    pub coordinator: CoordinatorHandle,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Production wiring: flat files under `data_dir`, `ffmpeg` for merges.
    /// Must be called from within a tokio runtime.
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        let storage = Arc::new(FlatFileStorage::new(&settings.data_dir)?);
        let transcoder = Arc::new(FfmpegTranscoder::new(settings.merge.clone()));
        Ok(Self::with_parts(
            settings,
            Arc::new(ClaimedIdentityAuth::new()),
            storage,
            transcoder,
            Arc::new(TracingCatalog),
        ))
    }

    /// Wire the state from explicit collaborators
    pub fn with_parts(
        settings: Settings,
        auth: Arc<dyn AuthService>,
        storage: Arc<dyn Storage>,
        transcoder: Arc<dyn Transcoder>,
        catalog: Arc<dyn RecordingCatalog>,
    ) -> Self {
        let hub = Arc::new(PeerHub::new());
        let coordinator = spawn_coordinator(
            &settings,
            CoordinatorDeps {
                storage,
                outbox: hub.clone(),
                transcoder,
                catalog,
            },
        );

        Self {
            auth,
            hub,
            coordinator,
            settings: Arc::new(settings),
        }
    }
}
