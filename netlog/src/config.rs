use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_INTERFACE: &str = "eth0";
pub const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:9090";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("unknown output format '{0}' (expected text, json or csv)")]
    Format(String),

    #[error("invalid metrics address '{0}'")]
    MetricsAddr(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// How emitted flow records are written out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Text,
    Json,
    Csv,
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "json" => Ok(Format::Json),
            "csv" => Ok(Format::Csv),
            _ => Err(ConfigError::Format(s.to_string())),
        }
    }
}

/// Agent configuration. Intervals are plain integers in the unit named by the
/// field so the TOML file stays readable.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interface: String,
    pub format: Format,
    pub metrics_addr: String,
    /// File of `<ipv4> <namespace>-<name>` lines backing the identity directory.
    pub directory_path: Option<PathBuf>,

    pub flush_interval_ms: u64,
    pub reap_interval_secs: u64,
    pub idle_timeout_secs: u64,

    pub packet_queue_capacity: usize,
    pub emit_queue_capacity: usize,
    pub read_buffer_size: usize,

    pub lookup_timeout_ms: u64,
    /// `None` keeps cached identities forever.
    pub identity_cache_ttl_secs: Option<u64>,
    pub metrics_retention_secs: u64,

    pub max_records_per_log: usize,
    pub record_log_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            format: Format::Text,
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            directory_path: None,
            flush_interval_ms: 1000,
            reap_interval_secs: 60,
            idle_timeout_secs: 300,
            packet_queue_capacity: 8192,
            emit_queue_capacity: 1000,
            read_buffer_size: 65536,
            lookup_timeout_ms: 5000,
            identity_cache_ttl_secs: None,
            metrics_retention_secs: 300,
            max_records_per_log: 100,
            record_log_interval_ms: 1000,
        }
    }
}

impl Config {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            (self.flush_interval_ms, "flush_interval_ms"),
            (self.reap_interval_secs, "reap_interval_secs"),
            (self.idle_timeout_secs, "idle_timeout_secs"),
            (self.lookup_timeout_ms, "lookup_timeout_ms"),
            (self.record_log_interval_ms, "record_log_interval_ms"),
            (self.packet_queue_capacity as u64, "packet_queue_capacity"),
            (self.emit_queue_capacity as u64, "emit_queue_capacity"),
            (self.read_buffer_size as u64, "read_buffer_size"),
            (self.max_records_per_log as u64, "max_records_per_log"),
        ];
        if let Some((_, name)) = nonzero.iter().find(|(value, _)| *value == 0) {
            return Err(ConfigError::Zero(name));
        }
        if self.identity_cache_ttl_secs == Some(0) {
            return Err(ConfigError::Zero("identity_cache_ttl_secs"));
        }
        self.metrics_socket_addr()?;
        Ok(())
    }

    /// Accepts the `:9090` shorthand for all interfaces.
    pub fn metrics_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.metrics_addr.starts_with(':') {
            format!("0.0.0.0{}", self.metrics_addr)
        } else {
            self.metrics_addr.clone()
        };
        addr.parse()
            .map_err(|_| ConfigError::MetricsAddr(self.metrics_addr.clone()))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn identity_cache_ttl(&self) -> Option<Duration> {
        self.identity_cache_ttl_secs.map(Duration::from_secs)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }

    pub fn record_log_interval(&self) -> Duration {
        Duration::from_millis(self.record_log_interval_ms)
    }
}
