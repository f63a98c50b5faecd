use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use tracing::info;

use offcache::cache::{keys, FileStore, SyncOutcome, Syncer};
use offcache::config::Config;
use offcache::db::CacheRecordStore;
use offcache::http::HttpFetcher;
use offcache::logging;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Keep web articles and their media available offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the cache directory from the config
  #[arg(long)]
  cache_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch an article and everything it references
  Cache {
    url: String,
    /// Group key to store it under (default: the canonical URL)
    #[arg(short, long)]
    group: Option<String>,
  },
  /// Remove a group and reclaim what nothing else uses
  Remove { group: String },
  /// Reclaim orphaned items and empty groups
  Reconcile {
    /// Keep running a pass every reconcile_interval_secs until interrupted
    #[arg(long)]
    watch: bool,
  },
  /// Write a cached resource to stdout
  Read { url: String },
  /// Show cache statistics
  Status {
    #[arg(long)]
    json: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = if let Some(cache_dir) = args.cache_dir {
    Config { cache_dir, ..config }
  } else {
    config
  };

  std::fs::create_dir_all(config.log_dir())
    .map_err(|e| eyre!("Failed to create {}: {}", config.log_dir().display(), e))?;
  let _guard = logging::init(&config.log_level, &config.log_dir());

  let syncer = build_syncer(&config)?;

  match args.command {
    Command::Cache { url, group } => {
      let group = group.unwrap_or_else(|| keys::group_key_for_url(&url));
      let done = syncer.request_cache(&url, &group).await?;
      if let SyncOutcome::Cached(outcome) = done.outcome {
        println!(
          "cached {} ({} items, {} written, {} unchanged, {} reused, {} skipped, {} attempt(s))",
          outcome.group_key,
          outcome.items.len(),
          outcome.written.len(),
          outcome.unchanged.len(),
          outcome.reused.len(),
          outcome.skipped.len(),
          done.attempts,
        );
      }
    }
    Command::Remove { group } => {
      let done = syncer.request_removal(&group).await?;
      if let SyncOutcome::Removed(outcome) = done.outcome {
        if outcome.existed {
          println!("removed {} ({} items reclaimed)", group, outcome.reclaimed.len());
        } else {
          println!("nothing cached under {}", group);
        }
      }
    }
    Command::Reconcile { watch: false } => {
      let report = syncer.run_reconciliation_pass().await?;
      println!(
        "reclaimed {} items, removed {} empty groups, {} failed",
        report.reclaimed.len(),
        report.empty_groups_removed,
        report.failed
      );
    }
    Command::Reconcile { watch: true } => {
      let interval = config
        .reconcile_interval()
        .ok_or_else(|| eyre!("reconcile_interval_secs is 0; nothing to watch"))?;
      info!(?interval, "Running reconciliation until interrupted");
      let reconciler = syncer.spawn_reconciler(interval);
      tokio::signal::ctrl_c().await?;
      reconciler.abort();
    }
    Command::Read { url } => {
      let bytes = syncer.read(&url).await?;
      std::io::stdout().lock().write_all(&bytes)?;
    }
    Command::Status { json } => {
      let stats = syncer.stats().await?;
      if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
      } else {
        println!("cache dir: {}", config.cache_dir.display());
        println!("groups:    {}", stats.records.groups);
        println!("items:     {}", stats.records.items);
        println!("links:     {}", stats.records.links);
        println!("on disk:   {} bytes", stats.used_bytes);
      }
    }
  }

  Ok(())
}

fn build_syncer(config: &Config) -> Result<Syncer<HttpFetcher>> {
  let files = FileStore::open(config.files_dir())?;
  let records = CacheRecordStore::open(&config.database_path())?;
  let fetcher = HttpFetcher::new(&config.http)?;

  Ok(Syncer::new(
    Arc::new(fetcher),
    Arc::new(records),
    Arc::new(files),
    config.syncer_options(),
  ))
}
