use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  /// SQLite file for the cache and the offline queue
  /// (defaults to $XDG_DATA_HOME/agentsync/agentsync.db)
  pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  #[serde(default = "default_base_url")]
  pub base_url: String,
  #[serde(default = "default_connect_timeout")]
  pub connect_timeout_secs: u64,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      base_url: default_base_url(),
      connect_timeout_secs: default_connect_timeout(),
      request_timeout_secs: default_request_timeout(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Seconds between background queue replays
  #[serde(default = "default_sync_interval")]
  pub interval_secs: u64,
  /// Failed replays after which a queued action is dropped
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      interval_secs: default_sync_interval(),
      max_retries: default_max_retries(),
    }
  }
}

/// Staleness TTLs per entity kind, in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_agents_ttl")]
  pub agents_ttl_secs: i64,
  #[serde(default = "default_chat_ttl")]
  pub chat_ttl_secs: i64,
  #[serde(default = "default_memories_ttl")]
  pub memories_ttl_secs: i64,
  #[serde(default = "default_memory_nodes_ttl")]
  pub memory_nodes_ttl_secs: i64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      agents_ttl_secs: default_agents_ttl(),
      chat_ttl_secs: default_chat_ttl(),
      memories_ttl_secs: default_memories_ttl(),
      memory_nodes_ttl_secs: default_memory_nodes_ttl(),
    }
  }
}

fn default_base_url() -> String {
  "http://localhost:8080/api".to_string()
}

fn default_connect_timeout() -> u64 {
  15
}

fn default_request_timeout() -> u64 {
  30
}

fn default_sync_interval() -> u64 {
  15 * 60
}

fn default_max_retries() -> u32 {
  crate::queue::DEFAULT_MAX_RETRIES
}

fn default_agents_ttl() -> i64 {
  60 * 60
}

fn default_chat_ttl() -> i64 {
  2 * 60
}

fn default_memories_ttl() -> i64 {
  15 * 60
}

fn default_memory_nodes_ttl() -> i64 {
  5 * 60
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./agentsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/agentsync/config.yaml
  ///
  /// Without any file the defaults are used.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Config::default()
      }
    };

    if let Ok(url) = std::env::var("AGENTSYNC_URL") {
      config.remote.base_url = url;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("agentsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("agentsync").join("config.yaml");
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

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the bearer token from the environment.
  ///
  /// Checks AGENTSYNC_TOKEN. A missing token is not an error here: cached
  /// reads and queueing still work, remote calls fail as unauthorized.
  pub fn get_token() -> Option<String> {
    std::env::var("AGENTSYNC_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
