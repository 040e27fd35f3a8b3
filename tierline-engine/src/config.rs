//! Configuration loading for Tierline nodes.
//!
//! The configuration is stored in TOML format and defines:
//! - Channel settings (wire format shared by every hop)
//! - Storage node settings (listen address, stats cadence)
//! - Coordinator node settings (listen address, storage peer, status cadence)
//! - Edge node settings (HTTP and subscriber listeners, coordinator peer)
//!
//! Every field has a default, so an empty file (or no file) starts a chain on
//! the loopback ports 3000-3003.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tierline_client::WireFormat;

/// Default config file name, looked up in the working directory first.
pub const CONFIG_FILE_NAME: &str = "tierline.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Settings shared by every event channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Envelope encoding inside each frame.
    #[serde(default)]
    pub wire_format: WireFormat,
}

/// Storage node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Address coordinators connect to.
    #[serde(default = "default_storage_listen")]
    pub listen: String,

    /// Seconds between `db:stats` broadcasts.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

fn default_storage_listen() -> String {
    "127.0.0.1:3002".to_string()
}

const fn default_stats_interval_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            listen: default_storage_listen(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Coordinator node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Address edge nodes connect to.
    #[serde(default = "default_coordinator_listen")]
    pub listen: String,

    /// Storage node to connect to at startup.
    #[serde(default = "default_storage_listen")]
    pub storage_addr: String,

    /// Seconds between `app:status` broadcasts.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// Expire storage queries pending longer than this. Unset keeps them
    /// until a reply arrives.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

fn default_coordinator_listen() -> String {
    "127.0.0.1:3001".to_string()
}

const fn default_status_interval_secs() -> u64 {
    15
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen: default_coordinator_listen(),
            storage_addr: default_storage_listen(),
            status_interval_secs: default_status_interval_secs(),
            call_timeout_secs: None,
        }
    }
}

impl CoordinatorConfig {
    #[must_use]
    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

/// Edge node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Address of the HTTP API.
    #[serde(default = "default_http_listen")]
    pub http_listen: String,

    /// Address subscribers connect to.
    #[serde(default = "default_subscriber_listen")]
    pub subscriber_listen: String,

    /// Coordinator node to connect to at startup.
    #[serde(default = "default_coordinator_listen")]
    pub coordinator_addr: String,

    /// Expire coordinator calls pending longer than this.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
}

fn default_http_listen() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_subscriber_listen() -> String {
    "127.0.0.1:3003".to_string()
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            http_listen: default_http_listen(),
            subscriber_listen: default_subscriber_listen(),
            coordinator_addr: default_coordinator_listen(),
            call_timeout_secs: None,
        }
    }
}

impl EdgeConfig {
    #[must_use]
    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.map(Duration::from_secs)
    }
}

/// Complete Tierline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TierlineConfig {
    #[serde(default)]
    pub channel: ChannelConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub edge: EdgeConfig,
}

impl TierlineConfig {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: TierlineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration (pure function).
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("storage.stats_interval_secs", self.storage.stats_interval_secs)?;
        require_positive(
            "coordinator.status_interval_secs",
            self.coordinator.status_interval_secs,
        )?;
        if let Some(secs) = self.coordinator.call_timeout_secs {
            require_positive("coordinator.call_timeout_secs", secs)?;
        }
        if let Some(secs) = self.edge.call_timeout_secs {
            require_positive("edge.call_timeout_secs", secs)?;
        }

        for (field, addr) in [
            ("storage.listen", &self.storage.listen),
            ("coordinator.listen", &self.coordinator.listen),
            ("coordinator.storage_addr", &self.coordinator.storage_addr),
            ("edge.http_listen", &self.edge.http_listen),
            ("edge.subscriber_listen", &self.edge.subscriber_listen),
            ("edge.coordinator_addr", &self.edge.coordinator_addr),
        ] {
            if addr.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!("{field} must not be empty")));
            }
        }

        if self.edge.http_listen == self.edge.subscriber_listen {
            return Err(ConfigError::ValidationError(format!(
                "edge.http_listen and edge.subscriber_listen both use {}",
                self.edge.http_listen
            )));
        }
        Ok(())
    }

    /// Pick the config file to load (pure function).
    ///
    /// An explicit path always wins. Otherwise the first existing candidate of
    /// `./tierline.toml` and `<config_dir>/tierline.toml` is used; `None`
    /// means run on defaults.
    #[must_use]
    pub fn resolve_path(
        explicit: Option<&Path>,
        working_dir: &Path,
        config_dir: Option<&Path>,
        exists: impl Fn(&Path) -> bool,
    ) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        std::iter::once(working_dir.join(CONFIG_FILE_NAME))
            .chain(config_dir.map(|dir| dir.join(CONFIG_FILE_NAME)))
            .find(|candidate| exists(candidate))
    }

    /// Load from `explicit`, or from the first default location that exists,
    /// or fall back to defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let working_dir = std::env::current_dir()?;
        let config_dir = directories::ProjectDirs::from("dev", "tierline", "tierline")
            .map(|dirs| dirs.config_dir().to_path_buf());

        match Self::resolve_path(explicit, &working_dir, config_dir.as_deref(), Path::exists) {
            Some(path) => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::load(path)
            }
            None => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }
}

fn require_positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{field} must be greater than zero"
        )));
    }
    Ok(())
}
