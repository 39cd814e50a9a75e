#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # tunctl
//!
//! Headless supervisor for OpenVPN client tunnels.
//!
//! tunctl launches one tunnel process per configured connection, attaches to
//! each over the loopback management interface, and drives the full
//! connection lifecycle: startup holds, credential prompts, reconnects,
//! host suspend/resume and graceful teardown.
//!
//! ## Subcommands
//!
//! - `tunctl run` (default) — supervise the configured connections
//! - `tunctl check` — parse and validate the config, print the registry
//!
//! ## Signals
//!
//! | Signal  | Effect                                      |
//! |---------|---------------------------------------------|
//! | SIGINT  | Graceful shutdown (stop all connections)    |
//! | SIGTERM | Graceful shutdown                           |
//! | SIGUSR1 | Suspend all connected tunnels (host sleep)  |
//! | SIGUSR2 | Resume suspended tunnels (host wake)        |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, signal handling
//! config.rs        — TOML + env-var configuration
//! dispatcher.rs    — single event loop owning the registry; Supervisor handle
//! connections/
//!   mod.rs         — fixed-capacity Registry, channel-token lookup
//!   connection.rs  — per-connection state machine and session data
//! manage/
//!   channel.rs     — loopback listener, line framing, reader task
//!   parser.rs      — notice/reply parsing
//!   command.rs     — FIFO command queue, secret wiping
//! launcher.rs      — direct process spawn, exit watcher, signals
//! service/
//!   mod.rs         — privileged helper bridge (Unix socket line protocol)
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use tunctl::connections::Registry;
use tunctl::{Config, Supervisor};

/// Headless supervisor for OpenVPN client tunnels.
#[derive(Parser)]
#[command(name = "tunctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise the configured connections (default when no subcommand given).
    Run {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Parse and validate the config, print the resulting registry as JSON.
    Check {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Check { config }) => check(config.as_deref()),
        Some(Commands::Run { config }) => run(config.as_deref()).await,
        None => run(None).await,
    }
}

fn check(config_path: Option<&str>) {
    let config = Config::load(config_path);
    if let Err(e) = config.validate() {
        eprintln!("config invalid: {e}");
        std::process::exit(1);
    }
    match Registry::from_config(&config) {
        Ok(registry) => {
            let snapshot = registry.snapshot();
            match serde_json::to_string_pretty(&snapshot) {
                Ok(json) => println!("{json}"),
                Err(e) => {
                    eprintln!("failed to render registry: {e}");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => {
            eprintln!("config invalid: {e}");
            std::process::exit(1);
        }
    }
}

async fn run(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("tunctl v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("config invalid: {e}");
        std::process::exit(1);
    }

    let registry = match Registry::from_config(&config) {
        Ok(registry) => registry,
        Err(e) => {
            error!("config invalid: {e}");
            std::process::exit(1);
        }
    };
    info!(
        "{} connection(s) configured, capacity {}",
        registry.len(),
        config.registry.max_connections
    );

    let config = Arc::new(config);
    let (supervisor, dispatcher_task) = tunctl::dispatcher::spawn(Arc::clone(&config), registry);

    // Kick off auto-connect entries
    for (index, conn) in config.connections.iter().enumerate() {
        if conn.auto_connect {
            info!("auto-connecting {}", conn.name);
            supervisor.start(tunctl::ConnId(index)).await;
        }
    }

    wait_for_signals(&supervisor).await;

    info!("Shutting down...");
    supervisor.shutdown().await;
    if let Err(e) = dispatcher_task.await {
        error!("dispatcher task failed: {e}");
    }
    info!("Goodbye");
}

/// Block until SIGINT/SIGTERM, relaying SIGUSR1/SIGUSR2 as suspend/resume.
async fn wait_for_signals(supervisor: &Supervisor) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("Failed to register SIGTERM");
        let mut sigusr1 = signal(SignalKind::user_defined1()).expect("Failed to register SIGUSR1");
        let mut sigusr2 = signal(SignalKind::user_defined2()).expect("Failed to register SIGUSR2");
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    info!("Received SIGINT");
                    return;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    return;
                }
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, suspending all tunnels");
                    supervisor.suspend_all().await;
                }
                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, resuming suspended tunnels");
                    supervisor.resume_all().await;
                }
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
