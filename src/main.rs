use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clip_relay::clip::ClipStore;
use clip_relay::config::ConfigStore;
use clip_relay::state::AppState;
use clip_relay::web;

/// How long shutdown waits for in-flight clip jobs
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Verbose,
    Debug,
    Trace,
}

/// clip-relay command line arguments
#[derive(Parser, Debug)]
#[command(name = "clip-relay")]
#[command(version, about = "Live camera relay with a triggered clip recorder", long_about = None)]
struct CliArgs {
    /// Configuration file (created with defaults when missing)
    #[arg(short = 'c', long, value_name = "FILE", default_value = "clip-relay.toml")]
    config: PathBuf,

    /// Listen address (overrides config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Clip directory (overrides config)
    #[arg(short = 'd', long, value_name = "DIR")]
    clip_dir: Option<PathBuf>,

    /// Log level (error, warn, info, verbose, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for verbose, -vv for debug, -vvv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting clip-relay v{}", env!("CARGO_PKG_VERSION"));

    let config_store = ConfigStore::load(&args.config)
        .await
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    tracing::info!("Configuration: {}", config_store.path().display());

    // Command line overrides apply to this run only
    let mut config = (*config_store.get()).clone();
    if let Some(address) = args.address {
        config.web.bind_address = address;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }
    if let Some(dir) = args.clip_dir {
        config.clips.dir = dir;
    }

    ClipStore::new(&config.clips.dir)
        .ensure_dir()
        .await
        .context("Clip directory is not usable")?;
    tracing::info!("Clip directory: {}", config.clips.dir.display());

    let addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.http_port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                config.web.bind_address, config.web.http_port
            )
        })?;

    let state = AppState::build(config).context("Failed to open capture sources")?;
    state.start().await.context("Failed to start capture")?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Starting HTTP server on {}", listener.local_addr()?);

    let app = web::create_router(state.clone());
    let serve_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            // Close long-lived sockets and viewer streams so the server can finish
            let _ = serve_state.shutdown_tx.send(());
            serve_state.relay.shutdown();
        })
        .await?;

    state.shutdown(DRAIN_TIMEOUT).await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

fn init_logging(level: LogLevel, verbose_count: u8) {
    // Verbose count overrides log level
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Verbose,
        2 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "clip_relay=error,tower_http=error",
        LogLevel::Warn => "clip_relay=warn,tower_http=warn",
        LogLevel::Info => "clip_relay=info,tower_http=info",
        LogLevel::Verbose => "clip_relay=debug,tower_http=info",
        LogLevel::Debug => "clip_relay=debug,tower_http=debug",
        LogLevel::Trace => "clip_relay=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
