//! Fundraising projector replay CLI
//!
//! Boots the engine against a recorded ledger and prints a projected view.
//!
//! Usage:
//!   fundraising-projector --calls calls.json --events events.jsonl \
//!       --controller 0x... --view orders
//!
//! `--calls` holds canned RPC answers (`[{"to", "method", "args"?, "result"}]`),
//! `--events` one raw ledger event per line.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fundraising_projector::ledger::FixtureLedger;
use fundraising_projector::snapshot::{MemorySnapshotStore, SnapshotStore, SqliteSnapshotStore};
use fundraising_projector::{Engine, EngineConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum View {
    Overview,
    Orders,
    Reserve,
    State,
}

#[derive(Parser, Debug)]
#[command(name = "fundraising-projector")]
#[command(about = "Replay fundraising ledger events and print the projected state")]
struct Args {
    /// Recorded raw events, one JSON object per line
    #[arg(long, env = "FUNDRAISING_EVENTS")]
    events: PathBuf,

    /// Canned RPC answers (JSON array)
    #[arg(long, env = "FUNDRAISING_CALLS")]
    calls: PathBuf,

    /// Engine config (TOML); FUNDRAISING_* variables override it
    #[arg(long, env = "FUNDRAISING_CONFIG")]
    config: Option<PathBuf>,

    /// Controller address, overrides the config
    #[arg(long)]
    controller: Option<String>,

    /// Persist snapshots to this SQLite database
    #[arg(long)]
    snapshot_db: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "overview")]
    view: View,
}

fn load_config(args: &Args) -> Result<EngineConfig> {
    let base = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let mut config = base.with_overrides(|key| std::env::var(key).ok());
    if let Some(controller) = &args.controller {
        config.controller = controller.clone();
    }
    if let Some(db) = &args.snapshot_db {
        config.snapshot_db = Some(db.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn replay(args: &Args, config: EngineConfig) -> Result<()> {
    let ledger = Arc::new(FixtureLedger::load_calls(&args.calls)?);
    let recorded = ledger.load_events(&args.events)?;
    info!("Loaded {} recorded events", recorded);

    let store: Arc<dyn SnapshotStore> = match &config.snapshot_db {
        Some(path) => Arc::new(SqliteSnapshotStore::open(path, &config.snapshot_key)?),
        None => Arc::new(MemorySnapshotStore::new()),
    };

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = cancel_tx.send(true);
        }
    });

    let engine = Engine::start(config, ledger.clone(), store, cancel_rx)
        .await
        .context("Engine bootstrap did not complete")?;
    engine.run(ledger.as_ref()).await?;
    info!("Replay finished: {:?}", engine.metrics());

    let rendered = match args.view {
        View::State => serde_json::to_string_pretty(&engine.current_state())?,
        View::Overview => serde_json::to_string_pretty(&engine.overview()?)?,
        View::Orders => serde_json::to_string_pretty(&engine.orders()?)?,
        View::Reserve => serde_json::to_string_pretty(&engine.reserve()?)?,
    };
    println!("{}", rendered);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,fundraising_projector=debug")),
        )
        .init();

    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            return ExitCode::from(2);
        }
    };

    match replay(&args, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
