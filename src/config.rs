use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub cache: CacheConfig,
  pub connectivity: ConnectivityConfig,
  pub queue: QueueConfig,
  pub fallback: FallbackConfig,
  pub storage: StorageConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Base url of the document API, e.g. https://erp.example.com
  pub url: Option<String>,
  /// Smallest read the server offers, used for connectivity probes
  pub probe_path: String,
  pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      url: None,
      probe_path: "/api/method/ping".to_string(),
      request_timeout_ms: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// TTL for list and document reads
  pub list_ttl_ms: u64,
  /// TTL for per-entity-type counts, independent of the list TTL
  pub count_ttl_ms: u64,
  /// Budget for a single live fetch before it is cancelled
  pub fetch_timeout_ms: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      list_ttl_ms: 30 * 60 * 1000,
      count_ttl_ms: 5 * 60 * 1000,
      fetch_timeout_ms: 8_000,
    }
  }
}

impl CacheConfig {
  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_millis(self.fetch_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// How long a probe verdict is reused before probing again
  pub debounce_ms: u64,
  pub probe_timeout_ms: u64,
  /// Start in operator-forced degraded (demo) mode
  pub degraded_mode: bool,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      debounce_ms: 30_000,
      probe_timeout_ms: 5_000,
      degraded_mode: false,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Failed replay attempts before a mutation is parked as failed
  pub max_retries: u32,
  pub base_delay_ms: u64,
  pub cap_delay_ms: u64,
  /// Periodic drain while the server is reachable
  pub drain_interval_ms: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay_ms: 1_000,
      cap_delay_ms: 5 * 60 * 1000,
      drain_interval_ms: 60_000,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
  /// JSON file with the bundled demo dataset
  pub dataset: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file (default: $XDG_DATA_HOME/depot-sync/sync.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  pub level: String,
  /// Directory for rolling log files (default: $XDG_DATA_HOME/depot-sync/logs)
  pub directory: Option<PathBuf>,
  /// Mirror log output to stderr
  pub stderr: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
      stderr: false,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./depot-sync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/depot-sync/config.yaml
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
    // Check current directory
    let local = PathBuf::from("depot-sync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("depot-sync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Get the API token from environment variables.
  ///
  /// Checks DEPOT_SYNC_TOKEN first, then DEPOT_API_TOKEN as fallback.
  pub fn get_api_token() -> Result<String> {
    std::env::var("DEPOT_SYNC_TOKEN")
      .or_else(|_| std::env::var("DEPOT_API_TOKEN"))
      .map_err(|_| {
        eyre!("API token not found. Set DEPOT_SYNC_TOKEN or DEPOT_API_TOKEN environment variable.")
      })
  }
}
