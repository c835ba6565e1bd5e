//! Inspect the ClinDoc record cache
//!
//! Usage:
//!   clindoc-sync --config clindoc.yaml status
//!   clindoc-sync list episodes
//!   clindoc-sync --offline pending
//!
//! Online commands refresh the cache from the record API first; with
//! `--offline` only the cached copies are read.

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use clindoc_sync::{
    Encounter, EntityKind, Episode, InMemoryRemoteApi, LocalCacheStore, Patient, RemoteApi, SyncConfig, SyncEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "clindoc-sync")]
#[command(about = "Inspect and refresh the ClinDoc offline record cache")]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "CLINDOC_CONFIG")]
    config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Never contact the record API
    #[arg(long)]
    offline: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record counts and how many are still local-only
    Status,
    /// Print one collection as JSON
    List {
        #[arg(value_enum)]
        kind: Kind,
    },
    /// Records no server has confirmed yet
    Pending,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Kind {
    Patients,
    Episodes,
    Encounters,
}

impl From<Kind> for EntityKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Patients => EntityKind::Patient,
            Kind::Episodes => EntityKind::Episode,
            Kind::Encounters => EntityKind::Encounter,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = SyncConfig::load(args.config.as_deref()).context("loading configuration")?;
    match args.verbose {
        0 => {}
        1 => config.logging.log_level = "debug".to_string(),
        _ => config.logging.log_level = "trace".to_string(),
    }
    logger_redacted::init(&config.logging)?;

    let engine = if args.offline {
        let remote = InMemoryRemoteApi::new();
        remote.set_available(false);
        let remote: Arc<dyn RemoteApi> = Arc::new(remote);
        let cache = match &config.cache_dir {
            Some(dir) => LocalCacheStore::in_dir(dir)?,
            None => LocalCacheStore::in_memory(),
        };
        SyncEngine::new(remote, cache, &config)?
    } else {
        SyncEngine::from_config(&config)?
    };
    let sync = engine.controller();

    info!(server = %config.server_url, offline = args.offline, "Refreshing record cache");
    sync.load().await?;

    match args.command {
        Command::Status => {
            let pending = sync.pending_records();
            println!("patients:   {}", sync.collection::<Patient>().len());
            println!("episodes:   {}", sync.collection::<Episode>().len());
            println!("encounters: {}", sync.collection::<Encounter>().len());
            println!("local-only: {}", pending.len());
        }
        Command::List { kind } => {
            let listing = match EntityKind::from(kind) {
                EntityKind::Patient => serde_json::to_string_pretty(&sync.collection::<Patient>())?,
                EntityKind::Episode => serde_json::to_string_pretty(&sync.collection::<Episode>())?,
                EntityKind::Encounter => serde_json::to_string_pretty(&sync.collection::<Encounter>())?,
            };
            println!("{listing}");
        }
        Command::Pending => {
            for local in sync.pending_records() {
                println!("{local}");
            }
        }
    }

    Ok(())
}
