//! Command-line entry point for the beacon daemon.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default address (0.0.0.0:9999, /events, ./event)
//! beacond
//!
//! # Serve with a config file and a different canned message directory
//! beacond serve --config beacon.toml --event-dir ./messages
//!
//! # Validate configuration and canned messages, then list the keys
//! beacond check
//!
//! # Override the address from the environment
//! BEACON_ADDR=127.0.0.1:8080 beacond
//!
//! # Enable debug logging
//! RUST_LOG=beacond=debug beacond
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (same as `exit` or closing stdin)

use std::env;
use std::io;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use beacon_core::config::parse_addr;
use beacon_core::{BeaconConfig, CannedMessages};

use crate::console::{spawn_stdin_reader, Console, ConsoleExit};
use crate::lifecycle::{wait_for_shutdown_signal, Daemon, ShutdownTrigger};

/// beacon - broadcast operator messages to SSE subscribers
#[derive(Parser, Debug)]
#[command(name = "beacond", version, about)]
pub struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:9999
    #[arg(long, global = true)]
    addr: Option<String>,

    /// Directory of canned JSON messages
    #[arg(long, global = true)]
    event_dir: Option<PathBuf>,

    /// Path of the event-stream endpoint
    #[arg(long, global = true)]
    events_path: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run the hub (default)
    Serve,
    /// Validate configuration and canned messages, then list the keys
    Check,
}

/// Parses arguments and runs the selected command.
pub fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_hub(&args),
        Command::Check => check(&args),
    }
}

/// Initializes the tracing subscriber.
///
/// Logs go to stderr so the operator console on stdout stays readable.
fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("beacond=info".parse()?)
                .add_directive("beacon_core=info".parse()?)
                .add_directive("beacon_protocol=info".parse()?),
        )
        .with_writer(io::stderr)
        .init();
    Ok(())
}

/// Builds the configuration: defaults, file, environment, then flags.
pub fn load_config(args: &Args) -> Result<BeaconConfig> {
    load_config_with(args, |name| env::var(name).ok())
}

/// Like [`load_config`], reading `BEACON_*` variables through `lookup`.
fn load_config_with<F>(args: &Args, lookup: F) -> Result<BeaconConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &args.config {
        Some(path) => BeaconConfig::from_file(path)?,
        None => BeaconConfig::default(),
    };

    config.apply_vars(lookup)?;

    if let Some(addr) = &args.addr {
        config.listen_addr = parse_addr(addr, "--addr")?;
    }
    if let Some(dir) = &args.event_dir {
        config.event_dir = dir.clone();
    }
    if let Some(path) = &args.events_path {
        config.events_path = path.clone();
    }

    config.validate()?;
    Ok(config)
}

/// Validates everything startup would and prints the canned keys.
fn check(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let table = CannedMessages::load(&config.event_dir).with_context(|| {
        format!(
            "Failed to load canned messages from {}",
            config.event_dir.display()
        )
    })?;

    println!("config ok: {} {}", config.listen_addr, config.events_path);
    println!("available keys: [{}]", table.keys().join(", "));
    Ok(())
}

/// Runs the hub (async entry point).
#[tokio::main]
async fn run_hub(args: &Args) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "beacon hub starting"
    );

    let config = load_config(args)?;

    // The table is complete before anything can publish.
    let table = Arc::new(
        CannedMessages::load(&config.event_dir).with_context(|| {
            format!(
                "Failed to load canned messages from {}",
                config.event_dir.display()
            )
        })?,
    );

    let daemon = Daemon::start(&config)
        .await
        .context("Failed to start hub")?;

    let console = Console::new(Arc::clone(&table), daemon.publisher(), io::stdout());
    let mut console_task = tokio::spawn(console.run(spawn_stdin_reader()));

    let trigger = async {
        tokio::select! {
            _ = shutdown_signal() => ShutdownTrigger::Signal,
            exit = &mut console_task => match exit {
                Ok(ConsoleExit::ExitCommand) => ShutdownTrigger::ExitCommand,
                Ok(ConsoleExit::EndOfInput) | Ok(ConsoleExit::QueueClosed) => {
                    ShutdownTrigger::EndOfInput
                }
                Err(e) => {
                    error!(error = %e, "Console task failed");
                    ShutdownTrigger::EndOfInput
                }
            },
        }
    };

    let report = daemon.run_until(trigger).await;
    console_task.abort();

    if report.is_clean() {
        info!(
            delivered = report.broadcast.delivered,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "beacon hub stopped"
        );
    } else {
        warn!(
            forced_subscribers = report.subscribers.forced,
            listener = ?report.listener,
            "beacon hub stopped after forcing shutdown steps"
        );
    }

    Ok(())
}

/// Resolves on SIGINT/SIGTERM. Never resolves if handlers can't be installed.
async fn shutdown_signal() {
    if let Err(e) = wait_for_shutdown_signal().await {
        error!(error = %e, "Error waiting for shutdown signal");
        std::future::pending::<()>().await;
    }
}
