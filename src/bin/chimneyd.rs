//! Chimney Daemon (chimneyd)
//!
//! Owns the connection supervisor and exposes it on a Unix control socket.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (requires root/sudo for TUN devices)
//! sudo chimneyd
//!
//! # Start with verbose logging and a custom configuration
//! sudo chimneyd --verbose --config /etc/chimney/chimney.toml
//! ```

use clap::Parser;
use libchimney::config::{ChimneyConfig, DEFAULT_CONFIG_FILE};
use libchimney::control::ControlServer;
use libchimney::error::{ChimneyError, ChimneyResult};
use libchimney::{
    ConfigStore, ConnectionSupervisor, FileProfileStore, ProcessEngine, StatusHub, TunDeviceProvider,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

/// Chimney Daemon
#[derive(Parser, Debug)]
#[command(name = "chimneyd")]
#[command(author = "chimney contributors")]
#[command(version)]
#[command(about = "Chimney Daemon - supervises the proxy-backed VPN tunnel", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the control socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Connect with the stored profile on startup
    #[arg(long)]
    connect: bool,
}

#[tokio::main]
async fn main() -> ChimneyResult<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Chimney Daemon (chimneyd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = ChimneyConfig::load_or_default(&args.config)?;
    if let Some(socket) = &args.socket {
        config.paths.socket_path = socket.clone();
    }
    config.ensure_directories()?;

    // Check if running as root
    #[cfg(target_os = "linux")]
    {
        let uid = unsafe { libc::getuid() };
        if uid != 0 {
            warn!("Not running as root - TUN device setup will likely fail");
        }
    }

    let engine = Arc::new(ProcessEngine::new(config.engine.clone()));
    if !engine.is_available() {
        warn!("Tunnel engine {:?} not found - connections will fail", config.engine.program);
    }

    let hub = Arc::new(StatusHub::new());
    let supervisor = Arc::new(ConnectionSupervisor::new(
        hub,
        engine,
        Arc::new(TunDeviceProvider::new(config.tunnel.clone())),
        config.supervisor.settings(),
    ));
    let store = Arc::new(FileProfileStore::new(&config.paths.profile_path));

    let server = ControlServer::new(&config.paths.socket_path, supervisor.clone(), store.clone());
    let listener = server.bind()?;

    if args.connect {
        match store.load().await {
            Ok(Some(profile)) => {
                let supervisor = supervisor.clone();
                tokio::task::spawn_blocking(move || supervisor.connect(profile))
                    .await
                    .map_err(|e| ChimneyError::ServiceError(format!("Connect task failed: {}", e)))?;
            }
            Ok(None) => warn!("--connect given but no profile is stored at {:?}", config.paths.profile_path),
            Err(e) => warn!("Could not load stored profile: {}", e),
        }
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = handle_signals(signal_token).await {
            error!("Signal handler error: {}", e);
        }
    });

    info!("Chimney Daemon is ready on {:?}", config.paths.socket_path);
    server.serve(listener, shutdown).await?;

    // Cleanup
    info!("Shutting down Chimney Daemon...");
    let timeout = config.supervisor.settings().stop_timeout + Duration::from_secs(1);
    let stopped = {
        let supervisor = supervisor.clone();
        tokio::task::spawn_blocking(move || supervisor.shutdown(timeout))
            .await
            .unwrap_or(false)
    };
    if !stopped {
        warn!("Connection worker did not exit cleanly");
    }
    server.cleanup();

    info!("Chimney Daemon stopped");
    Ok(())
}

/// Initialize logging based on command-line arguments
fn init_logging(args: &Args) {
    let log_level = if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            EnvFilter::new(format!("chimney={},chimneyd={},libchimney={}", log_level, log_level, log_level))
        });

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .init();
}

/// Handle Unix signals (SIGTERM, SIGINT, SIGHUP)
async fn handle_signals(shutdown: CancellationToken) -> ChimneyResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| ChimneyError::ServiceError(format!("Failed to register SIGTERM handler: {}", e)))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| ChimneyError::ServiceError(format!("Failed to register SIGINT handler: {}", e)))?;
    let mut sighup = signal(SignalKind::hangup())
        .map_err(|e| ChimneyError::ServiceError(format!("Failed to register SIGHUP handler: {}", e)))?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                break;
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, ignoring (configuration is read at startup)");
            }
        }
    }

    shutdown.cancel();
    Ok(())
}
