use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crms_cache::{Config, DataLayer, PrefetchContext, Role};

#[derive(Parser, Debug)]
#[command(name = "crms-cache")]
#[command(about = "Inspect and maintain the CRMS client cache and persistent store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/crms-cache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Write logs to crms-cache.log in the data directory instead of stderr
  #[arg(long, global = true)]
  log_file: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show persisted keys, their sizes and tiers
  Stats,
  /// Print a persisted value
  Get { key: String },
  /// Persist a value (parsed as JSON, stored as a string otherwise)
  Set {
    key: String,
    value: String,
    /// Add a `timestamp` field so the record ages normally
    #[arg(long)]
    stamped: bool,
  },
  /// Remove a persisted value
  Remove { key: String },
  /// Evict down to the sweep target if usage is above the sweep threshold
  Sweep,
  /// Remove every persisted value except critical ones and the current selection
  Clear,
  /// GET an API path through the cache
  Fetch {
    path: String,
    /// Query parameter as key=value, repeatable
    #[arg(short, long = "param")]
    params: Vec<String>,
  },
  /// Warm a bundle (by bundle or role name) and wait for it to finish
  Prefetch {
    bundle: String,
    #[arg(long)]
    faculty_id: Option<String>,
    #[arg(long)]
    term_id: Option<String>,
  },
  /// List known prefetch bundles
  Bundles,
  /// Run the periodic storage sweep until interrupted
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_tracing(args.log_file)?;

  let config = Config::load(args.config.as_deref())?;
  let data = DataLayer::from_config(&config)?;

  match args.command {
    Command::Stats => {
      let stats = data.stats();
      let quota = data.quota();
      println!("{}", serde_json::to_string_pretty(&stats)?);
      println!(
        "used {} / {} bytes ({:.1}%)",
        quota.used,
        quota.hard_limit,
        quota.usage_ratio() * 100.0
      );
    }
    Command::Get { key } => match data.store().get_value(&key) {
      Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
      None => return Err(eyre!("No value stored for {}", key)),
    },
    Command::Set {
      key,
      value,
      stamped,
    } => {
      let value: Value = serde_json::from_str(&value).unwrap_or(Value::String(value));
      let stored = if stamped {
        data.store().set_stamped(&key, &value)
      } else {
        data.set_persisted(&key, &value)
      };
      if !stored {
        return Err(eyre!("Failed to store {}, storage is full", key));
      }
    }
    Command::Remove { key } => {
      if !data.remove_persisted(&key) {
        return Err(eyre!("Failed to remove {}", key));
      }
    }
    Command::Sweep => match data.store().sweep() {
      Some(report) => println!(
        "removed {} keys, freed {} bytes: {}",
        report.removed.len(),
        report.freed,
        report.removed.join(", ")
      ),
      None => println!("usage below sweep threshold, nothing to do"),
    },
    Command::Clear => {
      let removed = data.store().clear_non_essential();
      println!("removed {} keys", removed);
    }
    Command::Fetch { path, params } => {
      let params = params
        .iter()
        .map(|p| {
          p.split_once('=')
            .ok_or_else(|| eyre!("Invalid parameter {}, expected key=value", p))
        })
        .collect::<Result<Vec<_>>>()?;
      let value = data.client().get(&path, &params).await?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Prefetch {
      bundle,
      faculty_id,
      term_id,
    } => {
      let name = match bundle.parse::<Role>() {
        Ok(role) => role.bundle_name().to_string(),
        Err(_) => bundle,
      };
      if data.prefetcher().bundle(&name).is_none() {
        return Err(eyre!("Unknown bundle {}", name));
      }
      let context = PrefetchContext {
        faculty_id,
        term_id,
      };
      data.trigger_prefetch(&name, context).await;
      println!("cached {} responses", data.client().cache().len());
    }
    Command::Bundles => {
      for name in data.prefetcher().bundle_names() {
        println!("{}", name);
      }
    }
    Command::Watch => {
      let sweeper = data.spawn_sweeper();
      tracing::info!(interval_secs = config.storage.sweep_interval_secs, "storage sweeper running");
      tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for interrupt: {}", e))?;
      sweeper.abort();
    }
  }

  Ok(())
}

/// Install the tracing subscriber.
///
/// `RUST_LOG` overrides the default `crms_cache=info` filter. The returned
/// guard flushes the log file on drop.
fn init_tracing(log_file: bool) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crms_cache=info"));

  if !log_file {
    tracing_subscriber::fmt()
      .with_env_filter(filter)
      .with_writer(std::io::stderr)
      .init();
    return Ok(None);
  }

  let dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("crms-cache");
  std::fs::create_dir_all(&dir).map_err(|e| eyre!("Failed to create log directory: {}", e))?;

  let appender = tracing_appender::rolling::never(&dir, "crms-cache.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();
  Ok(Some(guard))
}
