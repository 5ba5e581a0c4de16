use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Timing and storage parameters of the connection manager.
///
/// Durations are serialised as milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub ping_expiry: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_ms")]
    pub keepalive_window: Duration,
    #[serde(with = "duration_ms_list")]
    pub immediate_reconnect_delays: Vec<Duration>,
    #[serde(with = "duration_ms")]
    pub reconnect_jitter: Duration,
    #[serde(with = "duration_ms")]
    pub passive_reconnect_interval: Duration,
    /// Download every incoming attachment, not only those of visible conversations.
    pub auto_download_attachments: bool,
    pub attachment_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(24),
            ping_expiry: Duration::from_secs(40),
            keepalive_interval: Duration::from_secs(20 * 60),
            keepalive_window: Duration::from_secs(5 * 60),
            immediate_reconnect_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(10),
            ],
            reconnect_jitter: Duration::from_secs(1),
            passive_reconnect_interval: Duration::from_secs(30),
            auto_download_attachments: false,
            attachment_dir: std::env::temp_dir().join("relay-attachments"),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request_timeout must be positive"));
        }
        if self.ping_expiry.is_zero() {
            return Err(ConfigError::Invalid("ping_expiry must be positive"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid("keepalive_interval must be positive"));
        }
        if self.keepalive_window > self.keepalive_interval {
            return Err(ConfigError::Invalid(
                "keepalive_window must not exceed keepalive_interval",
            ));
        }
        if self.immediate_reconnect_delays.is_empty() {
            return Err(ConfigError::Invalid(
                "immediate_reconnect_delays must not be empty",
            ));
        }
        if self.passive_reconnect_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "passive_reconnect_interval must be positive",
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod duration_ms_list {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(value.iter().map(|d| d.as_millis() as u64))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Duration>, D::Error> {
        let millis = Vec::<u64>::deserialize(deserializer)?;
        Ok(millis.into_iter().map(Duration::from_millis).collect())
    }
}
