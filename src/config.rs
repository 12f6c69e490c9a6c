use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::namespace_of;

/// TTL used when neither the caller, the binding nor a namespace rule gives one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// How often the background sweeper drops stale entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Fallback TTL for every key
  #[serde(rename = "default_ttl_ms", deserialize_with = "deserialize_millis")]
  pub default_ttl: Duration,
  /// Background sweep period; zero disables the sweeper
  #[serde(rename = "sweep_interval_ms", deserialize_with = "deserialize_millis")]
  pub sweep_interval: Duration,
  /// Per-namespace TTLs, keyed by the text before the first `:` of a key
  #[serde(deserialize_with = "deserialize_millis_map")]
  pub namespaces: BTreeMap<String, Duration>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      default_ttl: DEFAULT_TTL,
      sweep_interval: DEFAULT_SWEEP_INTERVAL,
      namespaces: BTreeMap::new(),
    }
  }
}

fn deserialize_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let ms = u64::deserialize(deserializer)?;
  Ok(Duration::from_millis(ms))
}

fn deserialize_millis_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, Duration>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let m: BTreeMap<String, u64> = BTreeMap::deserialize(deserializer)?;
  Ok(
    m.into_iter()
      .map(|(ns, ms)| (ns, Duration::from_millis(ms)))
      .collect(),
  )
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided (must exist)
  /// 2. ./fetchcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fetchcache/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fetchcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fetchcache").join("config.yaml");
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

  /// Parse configuration from YAML text.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// TTL configured for the namespace of `key`, if any.
  pub fn namespace_ttl(&self, key: &str) -> Option<Duration> {
    self.namespaces.get(namespace_of(key)).copied()
  }

  /// Set the TTL for a namespace.
  pub fn with_namespace_ttl(mut self, namespace: impl Into<String>, ttl: Duration) -> Self {
    self.namespaces.insert(namespace.into(), ttl);
    self
  }

  pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
    self.default_ttl = ttl;
    self
  }
}
