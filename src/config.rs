//! Client configuration.

use crate::error::{Error, Result};
use crate::keyspace::KeyExtraction;
use crate::retry::RetryPolicy;
use crate::types::Endpoint;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Connection configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Connection name, used to tag log records.
    pub name: String,

    pub host: String,

    pub port: u16,

    /// Database index.
    pub db: u32,

    /// Period between health probes while connected.
    /// Default: 30s
    #[serde(with = "duration_secs")]
    pub monitor_interval: Duration,

    /// Emit lifecycle diagnostics (connect attempts, probe failures, waits).
    pub diagnostics: bool,

    /// Emit a trace record for every successful read and write.
    pub transactions: bool,

    pub retry: RetryPolicy,

    /// How keys are recovered from notification channel names.
    pub key_extraction: KeyExtraction,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "not-set".to_string(),
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            monitor_interval: Duration::from_secs(30),
            diagnostics: false,
            transactions: false,
            retry: RetryPolicy::default(),
            key_extraction: KeyExtraction::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            host: self.host.clone(),
            port: self.port,
            db: self.db,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.monitor_interval.is_zero() {
            return Err(Error::Config("monitor interval must be positive".into()));
        }
        if self.host.is_empty() {
            return Err(Error::Config("host must not be empty".into()));
        }
        self.retry.validate()
    }
}

/// Serde adapter storing a `Duration` as (fractional) seconds.
pub(crate) mod duration_secs {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}
