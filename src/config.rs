use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL that seed paths and relative fetch targets resolve against
  pub origin: Url,
  /// Current cache generation. Changing it discards every other namespace on activation.
  pub cache_name: String,
  /// Shell resources stored at install time
  pub seed: Vec<String>,
  /// Cache database location (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub cache_path: Option<PathBuf>,
  pub network: NetworkConfig,
  pub activation: ActivationConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse(DEFAULT_ORIGIN).expect("default origin is a valid URL"),
      cache_name: "pcp-learning-v1".to_string(),
      seed: vec!["index.html".to_string(), "/".to_string()],
      cache_path: None,
      network: NetworkConfig::default(),
      activation: ActivationConfig::default(),
      log: LogConfig::default(),
    }
  }
}

const DEFAULT_ORIGIN: &str = "http://localhost:8080/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub timeout_secs: u64,
  pub user_agent: String,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: 30,
      user_agent: concat!("shellcache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivationConfig {
  /// Activate a new version right after install instead of waiting for clients to close
  pub skip_waiting: bool,
  /// Take control of already open clients on activation
  pub claim_clients: bool,
}

impl Default for ActivationConfig {
  fn default() -> Self {
    Self {
      skip_waiting: true,
      claim_clients: true,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Write logs to this file instead of stderr
  pub file: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
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

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  /// Apply command line overrides and check the result again.
  pub fn apply_overrides(&mut self, origin: Option<Url>, cache_name: Option<String>) -> Result<()> {
    if let Some(origin) = origin {
      self.origin = origin;
    }
    if let Some(cache_name) = cache_name {
      self.cache_name = cache_name;
    }
    self.validate()
  }

  pub fn validate(&self) -> Result<()> {
    if self.cache_name.trim().is_empty() {
      return Err(eyre!("cache_name must not be empty"));
    }
    Ok(())
  }

  /// Resolve a path or URL against the configured origin.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .origin
      .join(target)
      .map_err(|e| eyre!("Invalid target '{}': {}", target, e))
  }

  /// The seed list as absolute URLs.
  pub fn seed_urls(&self) -> Result<Vec<Url>> {
    self.seed.iter().map(|path| self.resolve(path)).collect()
  }
}
