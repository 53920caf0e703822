//! Engine configuration.
//!
//! Values start from defaults, are overlaid by `~/.beach/tide.toml` when it
//! exists, then by `BEACH_TIDE_*` environment variables. The CLI applies its
//! own flags last.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::Deserialize;
use thiserror::Error;

use crate::sync::SyncConfig;
use crate::transport::ReconnectPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine home directory")]
    NoHome,
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncConfig,
    pub reconnect: ReconnectPolicy,
    #[serde(rename = "host_timeout_ms", with = "millis")]
    pub host_timeout: Duration,
    /// Ping interval on the host link.
    #[serde(rename = "heartbeat_ms", with = "millis")]
    pub heartbeat: Duration,
    /// Frames kept while the transport is down.
    pub outbound_buffer: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            reconnect: ReconnectPolicy::default(),
            host_timeout: Duration::from_secs(5),
            heartbeat: Duration::from_secs(15),
            outbound_buffer: 256,
            event_capacity: 512,
        }
    }
}

impl EngineConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = BaseDirs::new().ok_or(ConfigError::NoHome)?;
        Ok(base.home_dir().join(".beach").join("tide.toml"))
    }

    /// Defaults, then the user config file if present, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        let config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };
        config.with_env()
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    /// Applies `BEACH_TIDE_*` overrides read through `lookup`.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let millis_var = |var: &'static str| -> Result<Option<Duration>, ConfigError> {
            lookup(var)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map(Duration::from_millis)
                        .map_err(|_| ConfigError::Env { var, value })
                })
                .transpose()
        };

        if let Some(value) = millis_var("BEACH_TIDE_DEBOUNCE_MS")? {
            self.sync.debounce = value;
        }
        if let Some(value) = millis_var("BEACH_TIDE_INPUT_QUIET_MS")? {
            self.sync.input_quiet = value;
        }
        if let Some(value) = millis_var("BEACH_TIDE_CONTINUOUS_REFRESH_MS")? {
            self.sync.continuous_refresh = (!value.is_zero()).then_some(value);
        }
        if let Some(value) = millis_var("BEACH_TIDE_HOST_TIMEOUT_MS")? {
            self.host_timeout = value;
        }
        if let Some(value) = millis_var("BEACH_TIDE_HEARTBEAT_MS")? {
            self.heartbeat = value;
        }
        if let Some(value) = millis_var("BEACH_TIDE_RECONNECT_BASE_MS")? {
            self.reconnect.base_delay = value;
        }
        if let Some(value) = lookup("BEACH_TIDE_RECONNECT_MAX_RETRIES") {
            self.reconnect.max_retries = value.trim().parse().map_err(|_| ConfigError::Env {
                var: "BEACH_TIDE_RECONNECT_MAX_RETRIES",
                value,
            })?;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.debounce.is_zero() {
            return Err(ConfigError::Invalid("debounce window must be non-zero".into()));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "reconnect multiplier {} must be at least 1.0",
                self.reconnect.multiplier
            )));
        }
        if self.outbound_buffer == 0 || self.event_capacity == 0 {
            return Err(ConfigError::Invalid("buffer sizes must be non-zero".into()));
        }
        if self.host_timeout.is_zero() {
            return Err(ConfigError::Invalid("host timeout must be non-zero".into()));
        }
        if self.heartbeat.is_zero() {
            return Err(ConfigError::Invalid("heartbeat interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Durations stored as integer milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use super::*;

        /// `0` or a missing value disables the setting.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let value = Option::<u64>::deserialize(deserializer)?;
            Ok(value.filter(|ms| *ms > 0).map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.sync.debounce, Duration::from_millis(75));
        assert_eq!(config.host_timeout, Duration::from_secs(5));
        assert_eq!(config.outbound_buffer, 256);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn toml_overlays_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            host_timeout_ms = 2000
            heartbeat_ms = 5000

            [sync]
            debounce_ms = 60
            continuous_refresh_ms = 1000

            [reconnect]
            max_retries = 3
            "#,
        )
        .expect("parse config");
        assert_eq!(config.host_timeout, Duration::from_secs(2));
        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert_eq!(config.sync.debounce, Duration::from_millis(60));
        assert_eq!(config.sync.input_quiet, Duration::from_millis(150));
        assert_eq!(config.sync.continuous_refresh, Some(Duration::from_secs(1)));
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn env_overrides_apply() {
        let config = EngineConfig::default()
            .with_overrides(lookup(&[
                ("BEACH_TIDE_DEBOUNCE_MS", "90"),
                ("BEACH_TIDE_CONTINUOUS_REFRESH_MS", "0"),
                ("BEACH_TIDE_RECONNECT_MAX_RETRIES", "4"),
            ]))
            .expect("overrides");
        assert_eq!(config.sync.debounce, Duration::from_millis(90));
        assert_eq!(config.sync.continuous_refresh, None);
        assert_eq!(config.reconnect.max_retries, 4);
    }

    #[test]
    fn bad_env_value_is_reported() {
        let err = EngineConfig::default()
            .with_overrides(lookup(&[("BEACH_TIDE_HOST_TIMEOUT_MS", "soon")]))
            .expect_err("non-numeric value");
        assert!(matches!(
            err,
            ConfigError::Env {
                var: "BEACH_TIDE_HOST_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut config = EngineConfig::default();
        config.reconnect.multiplier = 0.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
