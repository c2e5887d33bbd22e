use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::DEFAULT_COMPRESS_THRESHOLD;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub environment: EnvironmentConfig,
  /// Work from the local store only, without contacting the server
  #[serde(default)]
  pub offline: bool,
  /// Root of the local stores (defaults to the platform data directory)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub resources: ResourcesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
  /// Names the local store directory
  pub name: String,
  pub url: String,
  pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResourcesConfig {
  /// Textual resources at least this large are stored gzip-compressed
  #[serde(default = "default_compress_threshold")]
  pub compress_threshold: usize,
}

impl Default for ResourcesConfig {
  fn default() -> Self {
    Self {
      compress_threshold: default_compress_threshold(),
    }
  }
}

fn default_compress_threshold() -> usize {
  DEFAULT_COMPRESS_THRESHOLD
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./ppsn.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/ppsn/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/ppsn/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("ppsn.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("ppsn").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config =
      serde_yaml::from_str(contents).map_err(|e| eyre!("Failed to parse config: {}", e))?;
    config.environment.validate()?;
    Ok(config)
  }

  /// Root directory for logs and local stores.
  pub fn data_root(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => dirs::data_dir()
        .map(|d| d.join("ppsn"))
        .ok_or_else(|| eyre!("Could not determine data directory")),
    }
  }

  /// `<data root>/<environment name>/localStore.db`
  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(
      self
        .data_root()?
        .join(&self.environment.name)
        .join("localStore.db"),
    )
  }

  /// Get the server password from the PPSN_PASSWORD environment variable.
  pub fn get_password() -> Result<String> {
    std::env::var("PPSN_PASSWORD")
      .map_err(|_| eyre!("Server password not found. Set PPSN_PASSWORD environment variable."))
  }
}

impl EnvironmentConfig {
  /// The name becomes a directory, so it must be a single plain segment.
  pub fn validate(&self) -> Result<()> {
    let name = self.name.trim();
    if name.is_empty()
      || name == "."
      || name == ".."
      || name.contains(['/', '\\', ':'])
    {
      return Err(eyre!("Invalid environment name '{}'", self.name));
    }
    Ok(())
  }
}
