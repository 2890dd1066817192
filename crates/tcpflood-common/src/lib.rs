use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Canonical greeting payload. Sent by the sender's burst and load modes and
/// echoed back by the listener to the first connections of every epoch.
pub const GREETING: &[u8] = b"Hello world!\n";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub sender: SenderConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads a YAML config file. Missing sections and fields fall back to
    /// their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&data).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(data: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to a mapping.
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ListenerConfig {
    pub addr: String,
    /// How long to wait for the first payload before classifying the
    /// connection as silent.
    pub grace_period_ms: u64,
    /// Silence after which a sink connection is closed.
    pub idle_timeout_ms: u64,
    /// Upper bound on the bytes inspected for classification.
    pub read_prefix_bytes: usize,
    pub greeting_replies_per_epoch: u32,
    /// Concurrent connection handlers. Acceptance pauses when exhausted.
    pub max_connections: usize,
    pub stream_chunk_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            grace_period_ms: 500,
            idle_timeout_ms: 30_000,
            read_prefix_bytes: 64,
            greeting_replies_per_epoch: 8,
            max_connections: 10_000,
            stream_chunk_bytes: 16 * 1024,
        }
    }
}

impl ListenerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SenderConfig {
    pub addr: String,
    pub connect_timeout_ms: u64,
    /// How long burst and load connections wait for a reply before closing.
    pub reply_timeout_ms: u64,
    /// Scheduling slice of the load-mode rate limiter.
    pub slice_ms: u64,
    /// Concurrent burst and load connections. Issuance pauses when exhausted.
    pub max_in_flight: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            connect_timeout_ms: 5_000,
            reply_timeout_ms: 1_000,
            slice_ms: 100,
            max_in_flight: 4_096,
        }
    }
}

impl SenderConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn slice(&self) -> Duration {
        Duration::from_millis(self.slice_ms.max(1))
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}
