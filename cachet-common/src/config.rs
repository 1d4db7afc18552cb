//! # Store Configuration
//!
//! Purpose: Describe how to reach the remote store and how patiently to
//! wait for it.
//!
//! ## Notes
//! - Loading the document (file, environment, secrets) is the caller's
//!   concern; this type only parses and renders it.
//! - Durations are serialized as integer milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection settings for the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Extra connect attempts after the first one fails.
    pub connect_retry: u32,
    /// Bound on each TCP connect attempt.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Bound on each awaited reply once connected.
    #[serde(with = "millis")]
    pub operation_timeout: Duration,
    /// Interval between keep-alive `PING`s; `None` disables them.
    #[serde(with = "optional_millis")]
    pub keep_alive: Option<Duration>,
    /// Logical database selected after connecting.
    pub database: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            connect_retry: 3,
            connect_timeout: Duration::from_millis(5000),
            operation_timeout: Duration::from_millis(5000),
            keep_alive: Some(Duration::from_secs(60)),
            database: 0,
        }
    }
}

impl StoreConfig {
    /// Default settings pointed at `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        StoreConfig {
            host: host.into(),
            port,
            ..StoreConfig::default()
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// `host:port`, suitable for `TcpStream::connect`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
