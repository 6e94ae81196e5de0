use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::{QuotaPolicy, Tier};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub api: ApiConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub prefetch: PrefetchConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL every request path is joined onto
  pub base_url: String,
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:3001/api".to_string(),
      timeout_secs: 15,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Freshness window for cached responses
  pub ttl_secs: u64,
  /// Maximum number of cached responses
  pub max_entries: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 5 * 60,
      max_entries: 100,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
  /// Delay between a view becoming active and its bundle being prefetched
  pub delay_millis: u64,
}

impl Default for PrefetchConfig {
  fn default() -> Self {
    Self { delay_millis: 1000 }
  }
}

impl PrefetchConfig {
  pub fn delay(&self) -> Duration {
    Duration::from_millis(self.delay_millis)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file for persisted state (defaults to the data directory)
  pub path: Option<PathBuf>,
  /// Capacity the backend enforces on writes
  pub capacity: usize,
  pub hard_limit: usize,
  pub safety_margin: usize,
  pub aggressive_ratio: f64,
  pub emergency_batch: usize,
  pub emergency_min_tier: u8,
  pub sweep_threshold: f64,
  pub sweep_target: f64,
  pub sweep_interval_secs: u64,
  pub grace_window_secs: u64,
}

impl Default for StorageConfig {
  fn default() -> Self {
    let policy = QuotaPolicy::default();
    Self {
      path: None,
      capacity: 5 * 1024 * 1024,
      hard_limit: policy.hard_limit,
      safety_margin: policy.safety_margin,
      aggressive_ratio: policy.aggressive_ratio,
      emergency_batch: policy.emergency_batch,
      emergency_min_tier: policy.emergency_min_tier.value(),
      sweep_threshold: policy.sweep_threshold,
      sweep_target: policy.sweep_target,
      sweep_interval_secs: 10 * 60,
      grace_window_secs: policy.grace_window.as_secs(),
    }
  }
}

impl StorageConfig {
  pub fn policy(&self) -> QuotaPolicy {
    QuotaPolicy {
      hard_limit: self.hard_limit,
      safety_margin: self.safety_margin,
      aggressive_ratio: self.aggressive_ratio,
      emergency_batch: self.emergency_batch,
      emergency_min_tier: Tier::new(self.emergency_min_tier),
      sweep_threshold: self.sweep_threshold,
      sweep_target: self.sweep_target,
      grace_window: Duration::from_secs(self.grace_window_secs),
      ..QuotaPolicy::default()
    }
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./crms-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/crms-cache/config.yaml
  ///
  /// Falls back to defaults when no file exists.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("crms-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("crms-cache").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    let storage = &self.storage;
    for (name, ratio) in [
      ("aggressive_ratio", storage.aggressive_ratio),
      ("sweep_threshold", storage.sweep_threshold),
      ("sweep_target", storage.sweep_target),
    ] {
      if !(0.0..=1.0).contains(&ratio) {
        return Err(eyre!("storage.{} must be between 0 and 1, got {}", name, ratio));
      }
    }
    if storage.sweep_target > storage.sweep_threshold {
      return Err(eyre!("storage.sweep_target must not exceed storage.sweep_threshold"));
    }
    Ok(())
  }

  /// Get the API token from environment variables.
  ///
  /// Checks CRMS_API_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("CRMS_API_TOKEN")
      .map_err(|_| eyre!("API token not found. Set the CRMS_API_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_config_uses_defaults() {
    let config = Config::parse("{}").unwrap();
    assert_eq!(config.cache.ttl(), Duration::from_secs(300));
    assert_eq!(config.storage.hard_limit, 4 * 1024 * 1024);
    assert_eq!(config.prefetch.delay(), Duration::from_secs(1));
  }

  #[test]
  fn test_partial_sections() {
    let yaml = r#"
api:
  base_url: https://crms.example.edu/api
storage:
  hard_limit: 1048576
  emergency_batch: 3
  emergency_min_tier: 12
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.api.base_url, "https://crms.example.edu/api");
    assert_eq!(config.api.timeout_secs, 15);

    let policy = config.storage.policy();
    assert_eq!(policy.hard_limit, 1024 * 1024);
    assert_eq!(policy.emergency_batch, 3);
    assert_eq!(policy.safety_margin, 100 * 1024);
    assert_eq!(policy.emergency_min_tier, Tier::BULK);
  }

  #[test]
  fn test_rejects_out_of_range_ratio() {
    let yaml = "storage:\n  aggressive_ratio: 1.5\n";
    assert!(Config::parse(yaml).is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/crms-cache.yaml"))).is_err());
  }
}
