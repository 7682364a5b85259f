//! Client configuration, loadable from YAML.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cache::DEFAULT_TTL;
use crate::clock::SharedClock;
use crate::limiter::{AdmissionPolicy, LimiterStrategy, Limits};

/// Request caps and the policy enforcing them.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LimitsConfig {
    pub strategy: LimiterStrategy,
    pub per_second: u32,
    pub per_minute: u32,
}

impl LimitsConfig {
    pub fn limits(&self) -> Limits {
        Limits::new(self.per_second, self.per_minute)
    }

    pub fn build(&self, clock: SharedClock) -> Arc<dyn AdmissionPolicy> {
        self.strategy.build(self.limits(), clock)
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = Limits::default();
        Self {
            strategy: LimiterStrategy::default(),
            per_second: limits.per_second,
            per_minute: limits.per_minute,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// How long fetched projects and versions are served from memory.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on how long an idle dispatcher parks before re-checking.
    #[serde(with = "humantime_serde")]
    pub idle_sleep: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_sleep: Duration::from_millis(100),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Service root, without the `/api/v2` suffix.
    pub base_url: String,

    pub user_agent: String,

    /// Key sent to `/authenticate`. Without one, sessions are public.
    pub api_key: Option<String>,

    pub limits: LimitsConfig,

    pub cache: CacheConfig,

    pub dispatcher: DispatcherConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://ore.spongepowered.org".to_string(),
            user_agent: concat!("ore-core/", env!("CARGO_PKG_VERSION")).to_string(),
            api_key: None,
            limits: LimitsConfig::default(),
            cache: CacheConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(ClientConfig::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_gives_defaults() {
        let config = ClientConfig::get(None).unwrap();
        assert_eq!(config.limits.limits(), Limits::new(2, 80));
        assert_eq!(config.cache.ttl, Duration::from_secs(300));
        assert_eq!(config.dispatcher.idle_sleep, Duration::from_millis(100));
        assert!(config.api_key.is_none());
    }

    #[test]
    fn partial_yaml_keeps_other_defaults() {
        let yaml = r#"
            base_url: http://localhost:3000
            api_key: secret
            limits:
              strategy: averaging
              per_second: 5
            cache:
              ttl: 30s
        "#;
        let config = ClientConfig::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(config.base_url, "http://localhost:3000");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.limits.strategy, LimiterStrategy::Averaging);
        assert_eq!(config.limits.limits(), Limits::new(5, 80));
        assert_eq!(config.cache.ttl, Duration::from_secs(30));
        assert_eq!(config.dispatcher, DispatcherConfig::default());
    }

    #[test]
    fn empty_config_is_rejected() {
        let err = ClientConfig::from_reader("  \n".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");
    }

    #[test]
    fn bad_duration_is_rejected() {
        let result = ClientConfig::from_reader("dispatcher:\n  idle_sleep: soon\n".as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_has_context() {
        let err = ClientConfig::get(Some(Path::new("/nonexistent/ore.yml"))).unwrap_err();
        assert!(err.to_string().contains("failed to open configuration file"));
    }
}
