//! spotihifid - headless streaming-audio daemon.
//!
//! Logs into the streaming service, keeps the user's library mirrored in
//! memory, plays tracks on a local audio device, and serves the
//! length-prefixed JSON-RPC control protocol over TCP until a shutdown
//! signal arrives.

mod config;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use spotihifi_core::session::sim::SimSession;
use spotihifi_core::{EngineConfig, PlayerEngine, RpcServer};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{FileConfig, Settings};

/// spotihifi daemon.
#[derive(Parser, Debug)]
#[command(name = "spotihifid")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local interface ip address to bind to.
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port to listen on.
    #[arg(short = 'p', long, default_value_t = 8081)]
    port: u16,

    /// Streaming-service username.
    #[arg(short = 'u', long)]
    username: Option<String>,

    /// Streaming-service password.
    #[arg(long)]
    password: Option<String>,

    /// Audio output device name, e.g. "plughw:0,0".
    #[arg(long = "audio-device", default_value = "default")]
    audio_device: String,

    /// Configuration filename.
    #[arg(short = 'c', long = "conf", default_value = "spotihifi.conf")]
    conf: PathBuf,

    /// Log filter (error, warn, info, debug, trace, or a tracing filter
    /// expression).
    #[arg(long, default_value = "info", env = "SPOTIHIFI_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level)
                .with_context(|| format!("invalid log filter '{}'", args.log_level))?,
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "spotihifid starting");

    let file = FileConfig::load(&args.conf)?;
    let settings = Settings::resolve(args.username, args.password, args.audio_device, file);

    let engine_config = EngineConfig {
        audio_device_name: settings.audio_device_name.clone(),
        cache_dir: settings.cache_dir.clone(),
        track_stat_filename: settings.track_stat_filename.clone(),
        last_fm_username: settings.last_fm_username.clone(),
        last_fm_password: settings.last_fm_password.clone(),
        volume_normalization: settings.volume_normalization,
    };

    // The session driver seam (`SessionDriver`) is where a real service
    // binding plugs in; the shipped build runs on the simulator.
    let engine = Arc::new(
        PlayerEngine::start(Box::new(SimSession::demo()), engine_config)
            .context("failed to start playback engine")?,
    );
    engine.login(&settings.username, &settings.password);

    let addr = SocketAddr::new(args.address, args.port);
    let server = RpcServer::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, "starting server, CTRL-C to stop");

    let shutdown = CancellationToken::new();
    let server_task = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = server.serve(engine, shutdown).await {
                tracing::error!(%err, "server error");
            }
        })
    };

    shutdown_signal().await;
    tracing::info!("shutdown signal received, cleaning up");

    shutdown.cancel();
    let _ = server_task.await;

    // Flushes playback state and persists track stats before the thread
    // joins.
    engine.shutdown();

    tracing::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
