use linput_common::tracing;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Location used when no `--config` argument is given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/linputd/config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Top-level configuration for linputd
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub daemon: DaemonSettings,
    pub input: InputSettings,
    pub channel: ChannelSettings,
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub log_level: String,
    /// Upper bound on one multiplexer wait, so shutdown is noticed promptly
    pub poll_timeout_ms: u64,
}

/// Where input devices are found
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub device_dir: PathBuf,
    pub node_prefix: String,
    pub watch_hotplug: bool,
}

/// Names of the objects owned by the consumer process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub shm_name: String,
    pub mutex_name: String,
    pub liveness_name: String,
    pub lock_timeout_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            poll_timeout_ms: 100,
        }
    }
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev/input"),
            node_prefix: "event".to_string(),
            watch_hotplug: true,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            shm_name: "/LinuxSharedMemory".to_string(),
            mutex_name: "/CBFLinuxMutex".to_string(),
            liveness_name: "/CBFWatchdogMutex".to_string(),
            lock_timeout_ms: 1000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match Self::read(path)? {
            Some(config) => {
                info!("Loaded configuration from {}", path.display());
                debug!("Configuration: {:?}", config);
                Ok(config)
            }
            None => Ok(Self::missing(path)),
        }
    }

    /// Read `path` without logging, for use before logging is set up.
    ///
    /// `None` means the file does not exist; any other failure is an error.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Option<Self>, ConfigError> {
        let path = path.as_ref();

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(ConfigError::Read { path: path.to_path_buf(), source });
            }
        };

        Self::from_yaml(&content)
            .map(Some)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Defaults for a configuration file that does not exist
    pub fn missing(path: &Path) -> Self {
        warn!("Configuration file {} not found, using defaults", path.display());
        Self::default()
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes as unit, not as an empty map
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Resolve the configured log level, falling back to INFO
    pub fn log_level(&self) -> tracing::Level {
        self.daemon.log_level.parse().unwrap_or(tracing::Level::INFO)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon.poll_timeout_ms)
    }
}

impl ChannelSettings {
    /// Longest wait for the channel lock before an event is dropped
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Pick the config path out of the command line (`--config <path>`)
pub fn config_path_from_args<I: IntoIterator<Item = String>>(args: I) -> PathBuf {
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return PathBuf::from(path);
            }
        } else if let Some(path) = arg.strip_prefix("--config=") {
            return PathBuf::from(path);
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}
