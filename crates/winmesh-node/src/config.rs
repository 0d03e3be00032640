//! Node configuration.
//!
//! Every field has a default, so an empty (or absent) file is valid. Values
//! are read from a TOML file first and then overridden from the environment:
//!
//! | Variable | Field |
//! |---|---|
//! | `WINMESH_CHANNEL` | `channel_name` |
//! | `WINMESH_MAX_PEERS` | `max_peers` |

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Channel peers rendezvous on when nothing else is configured.
pub const DEFAULT_CHANNEL: &str = "window-control";

pub const DEFAULT_MAX_PEERS: usize = 256;
pub const DEFAULT_COMMAND_BUFFER: usize = 100;
pub const DEFAULT_SIGNAL_BUFFER: usize = 32;

pub const ENV_CHANNEL: &str = "WINMESH_CHANNEL";
pub const ENV_MAX_PEERS: &str = "WINMESH_MAX_PEERS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Medium channel; only peers on the same channel see each other.
    pub channel_name: String,

    /// Registry capacity, local peer included.
    pub max_peers: usize,

    pub command_buffer: usize,
    pub signal_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL.to_string(),
            max_peers: DEFAULT_MAX_PEERS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            signal_buffer: DEFAULT_SIGNAL_BUFFER,
        }
    }
}

impl NodeConfig {
    /// Loads the configuration from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |key| env::var(key).ok())
    }

    /// Like [`NodeConfig::load`], with overrides read from `lookup`.
    /// Validation runs after the overrides.
    pub fn load_with(
        path: Option<&Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    /// Applies overrides from `lookup`, which maps a variable name to its
    /// value.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(channel) = lookup(ENV_CHANNEL) {
            self.channel_name = channel;
        }
        if let Some(raw) = lookup(ENV_MAX_PEERS) {
            self.max_peers = raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: ENV_MAX_PEERS,
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "channel_name",
                value: self.channel_name.clone(),
            });
        }
        if self.max_peers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_peers",
                value: self.max_peers.to_string(),
            });
        }
        for (key, value) in [
            ("command_buffer", self.command_buffer),
            ("signal_buffer", self.signal_buffer),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}
