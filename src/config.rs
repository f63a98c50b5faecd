use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{RetryPolicy, SyncerOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Root for cached files, the record database and logs
  pub cache_dir: PathBuf,
  /// Work units allowed in flight at once
  pub max_concurrent: usize,
  pub retry: RetryConfig,
  /// Seconds between background reconciliation passes (0 disables them)
  pub reconcile_interval_secs: u64,
  pub http: HttpConfig,
  /// Default filter when RUST_LOG is not set
  pub log_level: String,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_dir: default_cache_dir(),
      max_concurrent: 4,
      retry: RetryConfig::default(),
      reconcile_interval_secs: 300,
      http: HttpConfig::default(),
      log_level: "info".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts: policy.max_attempts,
      base_delay_ms: policy.base_delay.as_millis() as u64,
      max_delay_ms: policy.max_delay.as_millis() as u64,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("offcache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

fn default_cache_dir() -> PathBuf {
  dirs::data_dir()
    .unwrap_or_else(|| PathBuf::from("."))
    .join("offcache")
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// Without a file every setting takes its default.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file deserializes to null, which means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }

  pub fn files_dir(&self) -> PathBuf {
    self.cache_dir.join("files")
  }

  pub fn database_path(&self) -> PathBuf {
    self.cache_dir.join("cache.db")
  }

  pub fn log_dir(&self) -> PathBuf {
    self.cache_dir.join("logs")
  }

  pub fn syncer_options(&self) -> SyncerOptions {
    SyncerOptions {
      max_concurrent: self.max_concurrent.max(1),
      retry: RetryPolicy {
        max_attempts: self.retry.max_attempts.max(1),
        base_delay: Duration::from_millis(self.retry.base_delay_ms),
        max_delay: Duration::from_millis(self.retry.max_delay_ms),
      },
    }
  }

  pub fn reconcile_interval(&self) -> Option<Duration> {
    (self.reconcile_interval_secs > 0).then(|| Duration::from_secs(self.reconcile_interval_secs))
  }
}
