use anyhow::Context;
use clap::Parser;
use duet_backend_lib::{
    auth::ClaimedIdentityAuth,
    catalog::TracingCatalog,
    config::{LogFormat, Settings, DEFAULT_CONFIG_FILE},
    merge::FfmpegTranscoder,
    storage::{FlatFileStorage, Storage},
    ws_router, AppState,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Two-party call server with per-participant recording
#[derive(Parser, Debug)]
#[command(name = "duet-server", version, about)]
struct Cli {
    /// TOML config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Override the recordings directory
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_tracing(settings: &Settings) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_ascii_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match settings.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    if let Some(bind) = cli.bind {
        settings.bind_addr = bind;
    }
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }

    init_tracing(&settings);

    let storage = Arc::new(
        FlatFileStorage::new(&settings.data_dir)
            .with_context(|| format!("preparing {}", settings.data_dir.display()))?,
    );
    match storage.unmerged_sessions().await {
        Ok(pending) => {
            for dir in pending {
                tracing::warn!(
                    dir = %dir.path().display(),
                    "session was never merged, sources kept for manual recovery"
                );
            }
        },
        Err(e) => tracing::warn!(error = %e, "could not scan for unmerged sessions"),
    }

    let addr = settings.bind_addr;
    let transcoder = Arc::new(FfmpegTranscoder::new(settings.merge.clone()));
    let state = Arc::new(AppState::with_parts(
        settings,
        Arc::new(ClaimedIdentityAuth::new()),
        storage,
        transcoder,
        Arc::new(TracingCatalog),
    ));

    let app = ws_router::create_router(state);

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
