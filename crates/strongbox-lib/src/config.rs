use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub host: HostConfig,
}

/// Global configuration settings.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GlobalConfig {
    /// Root of the managed service. Index paths, ignore paths and restore
    /// destinations are relative to it.
    pub base_dir: String,
    /// Directory holding completed backups, relative to `base_dir` unless absolute.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: String,
    /// Age after which the catalog is rescanned from disk.
    #[serde(default = "default_catalog_refresh")]
    pub catalog_refresh_seconds: u64,
    /// How long to let the managed service settle after hold/unhold.
    #[serde(default = "default_host_settle")]
    pub host_settle_seconds: u64,
}

fn default_backup_dir() -> String {
    "Backups".to_string()
}

fn default_catalog_refresh() -> u64 {
    60
}

fn default_host_settle() -> u64 {
    5
}

/// How isolated (offline) operations spawn their child process.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LauncherConfig {
    /// Launcher executable. Defaults to `strongbox-launcher` next to the running binary.
    pub command: Option<String>,
    /// Extra arguments placed before the operation parameters.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Shell commands used to pause and resume the managed service.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct HostConfig {
    pub hold_command: Option<String>,
    pub unhold_command: Option<String>,
    /// Exit status 0 means the service is running.
    pub status_command: Option<String>,
}

impl GlobalConfig {
    pub fn new(base_dir: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            backup_dir: default_backup_dir(),
            catalog_refresh_seconds: default_catalog_refresh(),
            host_settle_seconds: default_host_settle(),
        }
    }

    pub fn base_path(&self) -> PathBuf {
        PathBuf::from(&self.base_dir)
    }

    /// Absolute location of the backup directory.
    pub fn backup_path(&self) -> PathBuf {
        let dir = Path::new(&self.backup_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.base_path().join(dir)
        }
    }

    pub fn catalog_refresh(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_seconds)
    }

    pub fn host_settle(&self) -> Duration {
        Duration::from_secs(self.host_settle_seconds)
    }
}

impl Config {
    /// Builds a configuration rooted at `base_dir` with every other setting at its default.
    pub fn with_base_dir(base_dir: impl Into<String>) -> Self {
        Self {
            global: GlobalConfig::new(base_dir),
            launcher: LauncherConfig::default(),
            host: HostConfig::default(),
        }
    }

    /// Validates the configuration and expands `~/` in every path.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.global.base_dir.trim().is_empty() {
            return Err(ConfigError::MissingField("global.base_dir".to_string()));
        }
        self.global.base_dir = expand_home(&self.global.base_dir);
        if !Path::new(&self.global.base_dir).is_absolute() {
            return Err(ConfigError::Validation(format!(
                "base_dir must be an absolute path, got '{}'",
                self.global.base_dir
            )));
        }

        if self.global.backup_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "backup_dir cannot be empty".to_string(),
            ));
        }
        self.global.backup_dir = expand_home(&self.global.backup_dir);

        if let Some(ref command) = self.launcher.command {
            if command.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "launcher.command cannot be empty".to_string(),
                ));
            }
            self.launcher.command = Some(expand_home(command));
        }
        Ok(())
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

/// Loads the configuration from the environment variable `STRONGBOX_CONFIG`
/// or the default system location (`~/.config/strongbox/config.toml`).
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be found, read, or parsed,
/// or if validation fails.
pub fn load_config() -> Result<Config, ConfigError> {
    let path = crate::paths::active_config_path();

    if !path.exists() {
        return Err(ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Config file not found: {:?}", path),
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let mut config: Config = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
