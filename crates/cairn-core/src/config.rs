//! Configuration for the transfer engine.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $CAIRN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/cairn/config.toml
//!   3. ~/.config/cairn/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::retry::{DEFAULT_COOLDOWN_PERIOD, UNLIMITED_RETRIES};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transfer: TransferConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Retry budget per request. -1 = unlimited.
    pub max_retries: i32,

    /// Every Nth retry parks the key on the cooldown queue. 0 = never.
    pub cooldown_period: u32,

    /// How long a key stays in cooldown, in seconds.
    pub cooldown_secs: u64,

    /// This many consecutive route-not-found failures make an insert count
    /// as placed. 0 disables the heuristic.
    pub consecutive_rnf_as_success: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for durable request snapshots.
    pub data_dir: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            cooldown_period: DEFAULT_COOLDOWN_PERIOD,
            cooldown_secs: 1800, // 30 minutes
            consecutive_rnf_as_success: 2,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir().join("requests"),
        }
    }
}

// ── Request contexts ──────────────────────────────────────────────────────────

/// Per-fetch parameter bundle handed to a fetch operation at construction.
#[derive(Debug, Clone, Copy)]
pub struct FetchContext {
    pub max_retries: i32,
    pub cooldown_period: u32,
}

impl FetchContext {
    /// Fetch forever. Used for subscriptions that must outlive any budget.
    pub fn unlimited() -> Self {
        Self {
            max_retries: UNLIMITED_RETRIES,
            cooldown_period: DEFAULT_COOLDOWN_PERIOD,
        }
    }
}

impl From<&EngineConfig> for FetchContext {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.transfer.max_retries,
            cooldown_period: config.transfer.cooldown_period,
        }
    }
}

/// Per-insert parameter bundle.
#[derive(Debug, Clone, Copy)]
pub struct InsertContext {
    pub max_retries: i32,
    pub cooldown_period: u32,
    pub consecutive_rnf_as_success: u32,
}

impl From<&EngineConfig> for InsertContext {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_retries: config.transfer.max_retries,
            cooldown_period: config.transfer.cooldown_period,
            consecutive_rnf_as_success: config.transfer.consecutive_rnf_as_success,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("cairn")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("cairn")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            EngineConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit file, no env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("CAIRN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EngineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply CAIRN_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__MAX_RETRIES") {
            if let Ok(n) = v.parse() {
                self.transfer.max_retries = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__COOLDOWN_PERIOD") {
            if let Ok(n) = v.parse() {
                self.transfer.cooldown_period = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__COOLDOWN_SECS") {
            if let Ok(n) = v.parse() {
                self.transfer.cooldown_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_TRANSFER__CONSECUTIVE_RNF_AS_SUCCESS") {
            if let Ok(n) = v.parse() {
                self.transfer.consecutive_rnf_as_success = n;
            }
        }
        if let Ok(v) = std::env::var("CAIRN_STORAGE__DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
    }
}
