use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use chronoor::config::Config;
use chronoor::pairer::source::StdinSource;
use chronoor::server::Server;
use chronoor::worker::Worker;

/// Passive NTP client telemetry capture and ingestion.
#[derive(Parser)]
#[command(name = "chronoor", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply without one.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a capture worker, reading packets from standard input.
    Worker {
        /// Interface name to tag captured sessions with, overriding the
        /// configured one.
        #[arg(long)]
        interface: Option<String>,
    },
    /// Run the central ingestion server.
    Server,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Target OS.
    pub fn target_os() -> &'static str {
        std::env::consts::OS
    }

    /// Target architecture.
    pub fn target_arch() -> &'static str {
        std::env::consts::ARCH
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            target_os(),
            target_arch(),
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Command::Version = cli.command {
        println!("chronoor {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting chronoor",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Worker { interface } => {
            if let Some(interface) = interface {
                cfg.worker.interface = interface;
            }
            rt.block_on(run_worker(cfg))
        }
        Command::Server => rt.block_on(run_server(cfg)),
        Command::Version => Ok(()),
    }
}

/// Spawn the SIGINT/SIGTERM watcher; the returned channel fires once on
/// either signal.
fn spawn_signal_handler() -> tokio::sync::oneshot::Receiver<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    shutdown_rx
}

async fn run_worker(cfg: Config) -> Result<()> {
    let mut shutdown_rx = spawn_signal_handler();

    let mut worker = Worker::new(cfg.worker);
    let source = StdinSource::new(worker.stats());
    worker.start(source);

    // Either a signal arrives or the packet input runs dry; both end in a
    // clean stop that flushes queued records.
    tokio::select! {
        _ = &mut shutdown_rx => {}
        _ = worker.join() => {
            tracing::info!("packet input finished");
        }
    }

    worker.stop().await;

    tracing::info!("chronoor worker stopped");

    Ok(())
}

async fn run_server(cfg: Config) -> Result<()> {
    let shutdown_rx = spawn_signal_handler();

    let mut server = Server::new(cfg.server);
    server.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    server.stop().await?;

    tracing::info!("chronoor server stopped");

    Ok(())
}
