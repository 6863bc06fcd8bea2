//! # Breakbot
//!
//! Runs the incident engines against the live registry: tracker sync,
//! stall reminders and archival.
//!
//! Usage:
//!   breakbot                          # Run with ~/.breakbot/config.toml
//!   breakbot --config ./breakbot.toml # Custom config file
//!   breakbot --once                   # One tick of each enabled engine, then exit
//!
//! With `--once`, tracker sync covers activity from the last `tick_secs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use breakbot_core::{BreakbotConfig, IncidentMachine, IncidentRegistry};
use breakbot_db::IncidentStore;
use breakbot_scheduler::{Annoyotron, Archivist, Engine, EngineHandle, Syntrax, spawn_engine};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "breakbot", version, about = "🚨 Breakbot: incident lifecycle engines")]
struct Cli {
    /// Config file (defaults to ~/.breakbot/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Run one tick of each enabled engine and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "breakbot=debug,breakbot_scheduler=debug"
    } else {
        "breakbot=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    // Config
    let config = match &cli.config {
        Some(path) => BreakbotConfig::load_from(&PathBuf::from(shellexpand::tilde(path).to_string())),
        None => BreakbotConfig::load(),
    }
    .context("loading config")?;
    let config = Arc::new(config);

    // Storage
    let db_path = config.database.resolved_path();
    let store = Arc::new(IncidentStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?);
    tracing::info!("💾 Database: {}", db_path.display());

    // Collaborators
    let chat = breakbot_channels::create_chat(&config.chat)?;
    if !chat.init().await {
        anyhow::bail!("{} chat adapter failed to initialise", chat.name());
    }
    let tracker = breakbot_providers::create_tracker(&config.tracker)?;
    if let Some(tracker) = &tracker {
        if !tracker.init().await {
            anyhow::bail!("{} tracker failed to initialise", tracker.name());
        }
    }
    let reporter = breakbot_providers::create_reporter(&config.report)?;
    if let Some(reporter) = &reporter {
        if !reporter.init().await {
            anyhow::bail!("{} report platform failed to initialise", reporter.name());
        }
    }

    // Registry
    let incidents = store.load_in_progress()?;
    let rooms: Vec<String> = incidents.iter().map(|i| i.chat_room.clone()).collect();
    let registry = incidents
        .into_iter()
        .map(IncidentMachine::new)
        .collect::<IncidentRegistry>()
        .shared();
    tracing::info!("📋 Loaded {} in-progress incidents", rooms.len());

    let joined = chat.joined_rooms().await.unwrap_or_else(|e| {
        tracing::warn!("⚠️ Could not list joined rooms: {e}");
        Vec::new()
    });
    for room in rooms.iter().filter(|r| !joined.contains(r)) {
        if let Err(e) = chat.join(room).await {
            tracing::warn!("⚠️ Could not join {room}: {e}");
        }
    }

    // Engines
    let engines = &config.engines;
    let period = Duration::from_secs(engines.tick_secs);
    let mut ticking: Vec<Arc<dyn Engine>> = Vec::new();
    if engines.syntrax {
        let mut syntrax = Syntrax::new(
            registry.clone(),
            Arc::clone(&store),
            tracker.clone(),
            Duration::from_secs(engines.sync_jitter_secs),
        )?;
        if cli.once {
            let since = chrono::Utc::now() - chrono::Duration::seconds(engines.tick_secs as i64);
            syntrax = syntrax.with_watermark(since);
        }
        ticking.push(Arc::new(syntrax));
    }
    if engines.annoyotron {
        ticking.push(Arc::new(Annoyotron::new(
            registry.clone(),
            Arc::clone(&chat),
            Arc::clone(&config),
        )));
    }
    if engines.archivist {
        let retention = chrono::Duration::seconds(engines.archive_after_secs as i64);
        ticking.push(Arc::new(Archivist::new(
            registry.clone(),
            Arc::clone(&store),
            Some(Arc::clone(&chat)),
            retention,
        )));
    }

    if cli.once {
        for engine in &ticking {
            tracing::info!("▶️ {} single tick", engine.name());
            engine.tick().await;
            engine.settle().await;
        }
        return Ok(());
    }

    let handles: Vec<EngineHandle> = ticking
        .iter()
        .map(|engine| spawn_engine(Arc::clone(engine), period))
        .collect();
    tracing::info!(
        "🚀 Breakbot running: {} engines, tick every {}s",
        handles.len(),
        period.as_secs()
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    tracing::info!("👋 Shutting down");
    for handle in handles {
        handle.shutdown().await;
    }
    for engine in &ticking {
        engine.settle().await;
    }
    Ok(())
}
