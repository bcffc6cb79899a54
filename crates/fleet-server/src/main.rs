use anyhow::{Context, Result};
use clap::Parser;
use fleet_config::ServerConfig;
use fleet_server::api::{self, AppState};
use fleet_server::logbuf::{LogBuffer, LogBufferLayer};
use fleet_server::pipeline::{AudioPipeline, HttpIntentMatcher, HttpSynthesizer, HttpTranscriber, LocalFuzzyMatcher};
use fleet_server::reaper;
use fleet_server::registry::Registry;
use fleet_server::router::CommandRouter;
use fleet_server::sessions::SessionManager;
use fleet_server::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Fleet coordination server for voice-controlled robotics devices.
///
/// Configuration is loaded from (in order, later wins):
/// 1. Compiled defaults
/// 2. /etc/fleetd/config.toml
/// 3. ~/.config/fleetd/config.toml
/// 4. ./fleetd.toml (or --config path)
/// 5. Environment variables (FLEET_*, plus RUST_LOG)
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to config file (overrides ./fleetd.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Show loaded configuration and exit
    #[arg(long)]
    show_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) =
        ServerConfig::load_with_sources_from(cli.config.as_deref()).context("failed to load configuration")?;

    if cli.show_config {
        println!("# Configuration sources:");
        for path in &sources.files {
            println!("#   - {}", path.display());
        }
        if !sources.env_overrides.is_empty() {
            println!("# Environment overrides:");
            for var in &sources.env_overrides {
                println!("#   - {var}");
            }
        }
        println!();
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let log_buffer = Arc::new(LogBuffer::new(fleet_server::logbuf::DEFAULT_CAPACITY));
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(LogBufferLayer::new(log_buffer.clone()))
        .init();

    info!("configuration loaded from:");
    for path in &sources.files {
        info!("   - {}", path.display());
    }
    if !sources.env_overrides.is_empty() {
        info!("   environment overrides: {:?}", sources.env_overrides);
    }

    let store = Store::open(&config.database_path)
        .with_context(|| format!("failed to open audit store at {:?}", config.database_path))?;
    info!("audit store ready at {:?}", config.database_path);

    let registry = Arc::new(Registry::new(store.clone()));
    let sessions = SessionManager::new(
        registry.clone(),
        store.clone(),
        config.outbound_queue_capacity,
        config.reserved_device_ids.clone(),
    );
    let router = CommandRouter::new(
        sessions.clone(),
        store.clone(),
        Duration::from_secs(config.command_ack_timeout_seconds),
    );
    sessions.set_router(router.clone());

    let pipeline = Arc::new(AudioPipeline::new(
        Arc::new(HttpTranscriber::new(stt_endpoint())),
        Arc::new(HttpSynthesizer::new(tts_endpoint())),
        match_endpoint()
            .map(|url| Arc::new(HttpIntentMatcher::new(url)) as Arc<dyn fleet_server::pipeline::IntentMatcher>)
            .unwrap_or_else(|| Arc::new(LocalFuzzyMatcher)),
        router.clone(),
        sessions.clone(),
        store.clone(),
        config.prefix_phrases.clone(),
        config.confidence_threshold,
        config.audio_sample_rate,
    ));

    let shutdown_token = CancellationToken::new();

    let reaper_handle = reaper::spawn(
        registry.clone(),
        sessions.clone(),
        router.clone(),
        Duration::from_secs(config.reaper_interval_seconds),
        Duration::from_secs(config.heartbeat_timeout_seconds),
        shutdown_token.clone(),
    );
    info!(
        "heartbeat reaper started (tick {}s, timeout {}s)",
        config.reaper_interval_seconds, config.heartbeat_timeout_seconds
    );

    let state = AppState {
        registry,
        sessions,
        router,
        store,
        pipeline,
        logs: log_buffer,
        read_limit_default: config.read_limit_default,
        read_limit_max: config.read_limit_max,
        started_at: Instant::now(),
    };
    let app = api::router(state);

    let bind_addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!("fleet server listening on {bind_addr}");
    info!("   websocket: ws://{bind_addr}/ws/{{device_id}}");
    info!("   health:    http://{bind_addr}/health");

    let server_shutdown = shutdown_token.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        server_shutdown.cancelled().await;
        info!("server shutdown signal received");
    });
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server.await {
            tracing::error!(error = %err, "server exited with error");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down gracefully");
        }
        _ = terminate_signal() => {
            info!("received SIGTERM, shutting down gracefully");
        }
    }

    shutdown_token.cancel();
    server_handle.await.ok();
    reaper_handle.await.ok();
    info!("shutdown complete");

    Ok(())
}

async fn terminate_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}

fn stt_endpoint() -> String {
    std::env::var("FLEET_STT_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8090/transcribe".to_string())
}

fn tts_endpoint() -> String {
    std::env::var("FLEET_TTS_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8091/synthesize".to_string())
}

fn match_endpoint() -> Option<String> {
    std::env::var("FLEET_MATCH_ENDPOINT").ok()
}
