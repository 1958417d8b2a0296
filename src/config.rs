use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub backend: BackendConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
  /// SQLite file holding local storage and cache partitions
  /// (defaults to $XDG_DATA_HOME/habesha-offline/state.db)
  pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
  /// Base URL of the hosted database service
  pub url: String,
  /// Path prefix of the table REST endpoints
  pub rest_path: String,
}

impl Default for BackendConfig {
  fn default() -> Self {
    Self {
      url: "http://localhost:54321".to_string(),
      rest_path: "/rest/v1".to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  /// Failed replays before an action is dropped
  pub max_retries: u32,
  /// Actions older than this are dropped on their next failed replay
  pub max_age_hours: i64,
  /// How often the status monitor refreshes
  pub poll_interval_ms: u64,
  /// How often `queue watch` probes the backend for connectivity
  pub probe_interval_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      max_age_hours: 24,
      poll_interval_ms: 1000,
      probe_interval_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Disable to route every request straight to the network
  pub enabled: bool,
  /// Origin the app shell is served from
  pub origin: String,
  pub precache_name: String,
  pub runtime_name: String,
  /// App-shell URLs stored at install time, relative to `origin`
  pub precache_urls: Vec<String>,
  pub offline_page: String,
  /// Same-origin paths with this prefix are API calls (network-first)
  pub api_prefix: String,
  /// Host fragments identifying the backend (network-first)
  pub backend_hosts: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      origin: "http://localhost:8080".to_string(),
      precache_name: "habesha-v1".to_string(),
      runtime_name: "habesha-runtime".to_string(),
      precache_urls: vec![
        "/".to_string(),
        "/offline.html".to_string(),
        "/images/hero.jpg".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
      api_prefix: "/api".to_string(),
      backend_hosts: vec!["supabase.co".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter directive when HABESHA_LOG is unset
  pub level: String,
  /// Write logs to a daily-rolling file instead of stderr
  pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      file: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./habesha.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/habesha-offline/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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
    let local = PathBuf::from("habesha.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("habesha-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    // An empty file deserializes to unit, not to an empty mapping
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks HABESHA_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  /// Writes are still attempted without a key; the backend decides.
  pub fn get_api_key() -> Option<String> {
    std::env::var("HABESHA_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .ok()
  }
}
