//! Configuration for the stress monitor.

use crate::alert::AlertPolicy;
use crate::history::HistoryLimits;
use crate::ingest::DEFAULT_DEVICE_ID;
use crate::model::ModelConfig;
use crate::store::StoreKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// File name of the JSON-lines record store inside `data_path`.
pub const RECORDS_FILE: &str = "records.jsonl";

/// Main configuration for the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Interface the server binds to
    pub bind_host: String,

    /// Port the server listens on (0 picks a free port)
    pub port: u16,

    /// Directory holding the record store
    pub data_path: PathBuf,

    /// Which record store backs persistence
    pub store: StoreKind,

    /// Which classifier scores samples
    pub model: ModelConfig,

    /// When samples raise a stress alert
    pub alert: AlertPolicy,

    /// History request limits
    pub history: HistoryLimits,

    /// Upper bound on one store call
    #[serde(with = "duration_serde")]
    pub persist_timeout: Duration,

    /// Upper bound on one model call
    #[serde(with = "duration_serde")]
    pub classify_timeout: Duration,

    /// Messages queued per connection before new ones are dropped
    pub outbound_buffer: usize,

    /// Device id recorded when a sample names none
    pub default_device_id: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stress-monitor");

        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 5000,
            data_path: data_dir,
            store: StoreKind::Jsonl,
            model: ModelConfig::default(),
            alert: AlertPolicy::default(),
            history: HistoryLimits::default(),
            persist_timeout: Duration::from_secs(5),
            classify_timeout: Duration::from_secs(2),
            outbound_buffer: 256,
            default_device_id: DEFAULT_DEVICE_ID.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content =
                std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("stress-monitor")
            .join("config.json")
    }

    /// Path of the JSON-lines record store.
    pub fn records_path(&self) -> PathBuf {
        self.data_path.join(RECORDS_FILE)
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.alert.threshold) {
            return Err(ConfigError::Invalid(format!(
                "alert.threshold must be within [0, 1], got {}",
                self.alert.threshold
            )));
        }
        if self.history.max_limit == 0 {
            return Err(ConfigError::Invalid(
                "history.max_limit must be positive".to_string(),
            ));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid(
                "outbound_buffer must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    SerializeError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {e}"),
            ConfigError::ParseError(e) => write!(f, "Parse error: {e}"),
            ConfigError::SerializeError(e) => write!(f, "Serialize error: {e}"),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
