//! KILN server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults, reading kiln.toml if present
//! kiln_server
//!
//! # Fixed worker count, no stdin console
//! kiln_server --config prod.toml --workers 4 --no-console
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kiln_server::{ServerBuilder, ServerConfig, ShutdownWatchdog, WorkerCount};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// KILN game server
#[derive(Parser, Debug)]
#[command(name = "kiln_server")]
#[command(about = "Authoritative tick server with worker-pool batch compression")]
#[command(version)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "kiln.toml")]
    config: PathBuf,

    /// Async worker count (overrides the config file)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Do not read commands from standard input
    #[arg(long)]
    no_console: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let mut config = if args.config.exists() {
        match ServerConfig::load(&args.config) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(%error, "Could not load configuration");
                return ExitCode::FAILURE;
            }
        }
    } else {
        tracing::info!(path = %args.config.display(), "No config file, using defaults");
        ServerConfig::default()
    };

    if let Some(workers) = args.workers {
        config.settings.async_workers = WorkerCount::Fixed(workers);
    }
    if args.no_console {
        config.console.enabled = false;
    }
    let shutdown_timeout = config.shutdown_timeout();

    let mut runtime = match ServerBuilder::new(config).build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!(%error, "Server failed to start");
            return ExitCode::FAILURE;
        }
    };

    runtime.run();

    let watchdog = match ShutdownWatchdog::arm(shutdown_timeout) {
        Ok(watchdog) => Some(watchdog),
        Err(error) => {
            tracing::warn!(%error, "Could not start shutdown watchdog");
            None
        }
    };
    let report = runtime.server.force_shutdown();
    if let Some(watchdog) = watchdog {
        watchdog.disarm();
    }

    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
