mod admins;
mod brain;
mod commands;
mod config;
mod dispatcher;
mod envelope;
mod listeners;
mod llm;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admins::{AdminRegistry, FileAdminStore};
use crate::brain::LlmBrain;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::listeners::ListenerRegistry;
use crate::storage::transactions::SqliteTransactionLog;
use crate::storage::Storage;

#[derive(Parser, Debug)]
#[command(name = "scarecrow", about = "Scarecrow chat bot")]
struct Cli {
    /// Enable debug logging.
    #[arg(long)]
    debug: bool,

    /// Show the version number and exit.
    #[arg(long)]
    version: bool,

    /// Path to the config file
    #[arg(default_value = "config.toml")]
    config: PathBuf,
}

fn version_banner() -> String {
    format!("This is Scarecrow, version {}", env!("CARGO_PKG_VERSION"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", version_banner());
        return Ok(());
    }
    let debug = cli.debug;
    let config_path = cli.config;

    // Initialize logging
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,scarecrow=debug".into())
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Scarecrow version {} is starting...",
        env!("CARGO_PKG_VERSION")
    );

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Model: {}", config.brain.model);
    info!("  Rules: {}", config.brain.rules_directory.display());
    info!(
        "  Listeners: {} ({} enabled)",
        config.listeners.len(),
        config.enabled_listeners().count()
    );

    let storage = Storage::open(&config.database.path);

    let admins = AdminRegistry::load(
        Box::new(FileAdminStore::new(&config.admins.path)),
        &config.admins.initial,
    )?;
    info!("Admins: {}", admins.list().await.join(", "));

    let brain = LlmBrain::load(config.brain.clone())
        .await
        .context("Failed to load the brain")?;

    let registry = ListenerRegistry::with_builtin();
    info!("Listener types: {}", registry.kinds().join(", "));

    let dispatcher = Dispatcher::new(
        Arc::new(brain),
        admins,
        Arc::new(SqliteTransactionLog::new(storage.clone())),
        storage,
        registry,
    );

    // Sign on all the enabled bots.
    if let Err(e) = dispatcher.start_all_bots(&config.listeners).await {
        error!("{:#}", e);
        std::process::exit(1);
    }

    if dispatcher.active_listeners().await.is_empty() {
        warn!("No listeners are active; nothing to do.");
        std::process::exit(0);
    }

    tokio::select! {
        _ = dispatcher.wait_for_termination() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; asking all listeners to stop");
            dispatcher.shutdown().await;
            dispatcher.wait_for_termination().await;
        }
    }

    // A console listener may still have a blocking stdin read in flight,
    // which would hold up runtime shutdown.
    std::process::exit(0);
}
