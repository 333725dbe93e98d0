use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use depot_sync::tasks::spawn_sync_task;
use depot_sync::{logging, Config, MutationAction, SyncCore};

#[derive(Parser, Debug)]
#[command(name = "depot-sync")]
#[command(about = "Offline cache and mutation replay for a warehouse document API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/depot-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Force degraded mode: no probes, no replay
  #[arg(long)]
  degraded: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show the connectivity verdict and queue summary
  Status {
    /// Ignore the cached verdict and probe now
    #[arg(long)]
    probe: bool,
  },
  /// Record counts for one or more entity types
  Counts {
    #[arg(required = true)]
    entity_types: Vec<String>,
  },
  /// Read the list for an entity type through the fallback chain
  List {
    entity_type: String,
    /// Skip the cache tier
    #[arg(long)]
    refresh: bool,
    /// Server-side filters as JSON, e.g. '[["Item","disabled","=",0]]'
    #[arg(long)]
    filters: Option<String>,
  },
  /// Queue a write for replay
  Enqueue {
    entity_type: String,
    entity_id: String,
    /// create, update or complete
    action: MutationAction,
    /// JSON payload
    payload: Option<String>,
  },
  /// Inspect or operate the mutation queue
  Queue {
    #[command(subcommand)]
    command: QueueCommand,
  },
  /// Manage cached reads
  Cache {
    #[command(subcommand)]
    command: CacheCommand,
  },
  /// Replay queued writes whenever the server is reachable, until ctrl-c
  Watch,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// List every queued mutation
  List {
    /// Only those that need attention
    #[arg(long)]
    failed: bool,
  },
  /// Replay due mutations now
  Drain,
  /// Reset a failed mutation so it is replayed again
  Retry { id: String },
  /// Drop a mutation without replaying it
  Discard { id: String },
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// Remove cached reads
  Clear {
    /// Only entries for this entity type
    #[arg(long)]
    entity_type: Option<String>,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if args.degraded {
    config.connectivity.degraded_mode = true;
  }

  let _guard = logging::init(&config.log)?;
  let core = SyncCore::open(&config)?;

  match args.command {
    Command::Status { probe } => {
      let verdict = core.monitor().verdict(probe).await;
      let queue = core.queue().summary()?;
      print_json(&json!({ "connectivity": verdict, "queue": queue }))?;
    }
    Command::Counts { entity_types } => {
      let types: Vec<&str> = entity_types.iter().map(String::as_str).collect();
      let counts = core.counts().get_all_counts(&types).await;
      print_json(&counts)?;
    }
    Command::List {
      entity_type,
      refresh,
      filters,
    } => {
      let resolved = match filters {
        Some(raw) => {
          let filters: Value =
            serde_json::from_str(&raw).map_err(|e| eyre!("Filters are not valid JSON: {}", e))?;
          core
            .resolver()
            .list_filtered(&entity_type, filters, refresh)
            .await?
        }
        None => core.resolver().list(&entity_type, refresh).await?,
      };
      print_json(&resolved)?;
    }
    Command::Enqueue {
      entity_type,
      entity_id,
      action,
      payload,
    } => {
      let payload = match payload {
        Some(raw) => {
          serde_json::from_str(&raw).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?
        }
        None => Value::Null,
      };
      let record = core
        .queue()
        .enqueue(&entity_type, &entity_id, action, payload)?;
      print_json(&record)?;
    }
    Command::Queue { command } => match command {
      QueueCommand::List { failed } => {
        let records = if failed {
          core.queue().failed()?
        } else {
          core.queue().all()?
        };
        print_json(&records)?;
      }
      QueueCommand::Drain => {
        let report = core.queue().drain().await;
        print_json(&report)?;
      }
      QueueCommand::Retry { id } => print_json(&core.queue().retry(&id)?)?,
      QueueCommand::Discard { id } => print_json(&core.queue().discard(&id)?)?,
    },
    Command::Cache { command } => match command {
      CacheCommand::Clear { entity_type } => {
        let removed = match entity_type {
          Some(entity_type) => core.cache().invalidate_entity_type(&entity_type),
          None => core.cache().invalidate_all(),
        };
        print_json(&json!({ "removed": removed }))?;
      }
    },
    Command::Watch => {
      let interval = Duration::from_millis(config.queue.drain_interval_ms);
      let handle = spawn_sync_task(
        core.queue().clone(),
        core.monitor().clone(),
        interval,
      );
      tokio::signal::ctrl_c().await?;
      info!("shutting down sync task");
      handle.abort();
    }
  }

  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
