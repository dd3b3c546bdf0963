use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Port to listen on for HTTP requests
    pub listen_port: u16,
    /// Where bare anonymous tokens are redirected, followed by `/TOKEN`
    pub unlock_path: String,
    /// Where bare inbox tokens are redirected, followed by `/TOKEN`
    pub deposit_path: String,
    /// Seconds between reaper runs
    pub reaper_interval_secs: u64,
    /// Expired allocations purged per reaper run
    pub reaper_batch_size: usize,
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,
    /// Also write rolling `courier.*.log` files here
    pub log_dir: Option<PathBuf>,
    /// How often the log file rolls over
    pub log_rotation: LogRotation,
    /// Rolled log files kept in `log_dir`; unset keeps them all
    pub log_max_files: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            unlock_path: "/unlock".to_string(),
            deposit_path: "/deposit".to_string(),
            reaper_interval_secs: 300,
            reaper_batch_size: 100,
            log_level: "info".to_string(),
            log_dir: None,
            log_rotation: LogRotation::Daily,
            log_max_files: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl GatewayConfig {
    /// Load from a TOML file; a missing file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("config {:?} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}
