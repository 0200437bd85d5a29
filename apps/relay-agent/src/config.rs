//! Agent configuration.
//!
//! Read from the TOML file named by `RELAY_AGENT_CONFIG`, or from
//! `/etc/dpu-relay/agent.toml`. A missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use relay_file_ops::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE, TransferLimits};
use relay_protocol::HashMethod;
use relay_transfer::{DEFAULT_HOST_MOUNT, PathPolicy};
use serde::{Deserialize, Serialize};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "RELAY_AGENT_CONFIG";

pub const DEFAULT_CONFIG_PATH: &str = "/etc/dpu-relay/agent.toml";

/// Agent configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Address the upload server listens on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Where the host root filesystem is mounted inside this process's view.
    #[serde(default = "default_host_mount")]
    pub host_mount: PathBuf,

    /// JSON snapshot of the midplane state table.
    #[serde(default)]
    pub state_table: Option<PathBuf>,

    /// JSON snapshot of the DPU config table.
    #[serde(default)]
    pub config_table: Option<PathBuf>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Seconds an upload connection may sit idle between uploads.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds a receiver waits for the next frame of an upload.
    #[serde(default = "default_frame_timeout_secs")]
    pub frame_timeout_secs: u64,

    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Bounds for `TransferToRemote`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_transfer_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub hash_method: HashMethod,
}

fn default_listen() -> String {
    "0.0.0.0:50052".into()
}

fn default_host_mount() -> PathBuf {
    PathBuf::from(DEFAULT_HOST_MOUNT)
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_frame_timeout_secs() -> u64 {
    60
}

fn default_transfer_timeout_secs() -> u64 {
    300
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            host_mount: default_host_mount(),
            state_table: None,
            config_table: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            frame_timeout_secs: default_frame_timeout_secs(),
            transfer: TransferConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_transfer_timeout_secs(),
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
            hash_method: HashMethod::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from `RELAY_AGENT_CONFIG` or the default path.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    /// Loads the configuration at `path`, or the defaults when it does not
    /// exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.transfer.chunk_size == 0 {
            anyhow::bail!("transfer.chunk_size must be greater than zero");
        }
        if !self.host_mount.is_absolute() {
            anyhow::bail!(
                "host_mount must be absolute, got {}",
                self.host_mount.display()
            );
        }
        Ok(())
    }

    pub fn path_policy(&self) -> PathPolicy {
        PathPolicy::new(&self.host_mount)
    }

    pub fn limits(&self) -> TransferLimits {
        TransferLimits {
            timeout: Duration::from_secs(self.transfer.timeout_secs),
            max_file_size: self.transfer.max_file_size,
            chunk_size: self.transfer.chunk_size,
            hash_method: self.transfer.hash_method,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_secs(self.frame_timeout_secs)
    }
}
