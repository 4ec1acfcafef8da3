//! Configuration management
//!
//! Handles loading and saving the updater's configuration file.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    NoConfigDir,
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Release sources
    pub sources: SourcesConfig,
    /// Network settings
    pub network: NetworkConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Payload location, relative to the SD root (leading slash optional)
    pub payload_path: String,
    /// Copy the installed payload to `<path>.bak` before updating
    pub backup_existing: bool,
    /// Check for new versions of the updater itself
    pub self_update: bool,
    /// Directory standing for the root of the SD card
    pub sd_root: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            payload_path: "/arm9loaderhax.bin".into(),
            backup_existing: true,
            self_update: true,
            sd_root: PathBuf::from("/"),
        }
    }
}

impl GeneralConfig {
    /// Absolute location of the installed payload
    pub fn payload_file(&self) -> PathBuf {
        self.sd_root
            .join(self.payload_path.trim_start_matches('/'))
    }
}

/// Where releases are fetched from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourcesConfig {
    /// Releases API endpoint for the latest stable Luma3DS release
    pub stable_release_url: String,
    /// Releases API endpoint for the latest release of the updater itself
    pub updater_release_url: String,
    /// Hourly build branches, checked in order
    pub hourly_branches: Vec<HourlyBranchConfig>,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            stable_release_url: "https://api.github.com/repos/AuroraWright/Luma3DS/releases/latest"
                .into(),
            updater_release_url:
                "https://api.github.com/repos/KunoichiZ/lumaupdate/releases/latest".into(),
            hourly_branches: vec![
                HourlyBranchConfig {
                    label: "normal".into(),
                    friendly_name: "latest hourly".into(),
                    last_commit_url:
                        "https://raw.githubusercontent.com/astronautlevel2/Luma3DS/gh-pages/lastCommit"
                            .into(),
                    build_url: "https://astronautlevel2.github.io/Luma3DS/builds/Luma-{commit}.zip"
                        .into(),
                },
                HourlyBranchConfig {
                    label: "dev".into(),
                    friendly_name: "latest developer hourly".into(),
                    last_commit_url:
                        "https://raw.githubusercontent.com/astronautlevel2/Luma3DSDev/gh-pages/lastCommit"
                            .into(),
                    build_url:
                        "https://astronautlevel2.github.io/Luma3DSDev/builds/Luma-{commit}.zip"
                            .into(),
                },
            ],
        }
    }
}

/// One hourly build branch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HourlyBranchConfig {
    /// Key in the catalog's commit map ("normal", "dev")
    pub label: String,
    /// Name shown to the user
    pub friendly_name: String,
    /// Plain-text file holding the last built commit
    pub last_commit_url: String,
    /// Build archive URL; `{commit}` is replaced with the commit id
    pub build_url: String,
}

impl HourlyBranchConfig {
    /// Download URL of the build for `commit`
    pub fn build_url_for(&self, commit: &str) -> String {
        self.build_url.replace("{commit}", commit)
    }
}

/// Network settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// User agent sent with every request (the GitHub API requires one)
    pub user_agent: String,
    /// Request timeout in seconds (0 = no timeout)
    pub timeout_secs: u64,
    /// Download in short bounded polls instead of one blocking read
    pub incremental_download: bool,
    /// Time budget of one download poll in milliseconds, checked between reads
    pub download_tick_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: "LUMA-UPDATER".into(),
            timeout_secs: 60,
            incremental_download: true,
            download_tick_ms: 10,
        }
    }
}

/// Get the configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "lumaupdate", "lumaupdate").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the default configuration file path
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("config.toml"))
}

/// Load configuration from the default location
pub fn load_config() -> Result<Config, ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    load_config_from(&path)
}

/// Load configuration from `path`, falling back to defaults if it is missing
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        log::debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to the default location
pub fn save_config(config: &Config) -> Result<(), ConfigError> {
    let path = config_path().ok_or(ConfigError::NoConfigDir)?;
    save_config_to(config, &path)
}

/// Save configuration to `path`
pub fn save_config_to(config: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, &content)?;
    Ok(())
}
