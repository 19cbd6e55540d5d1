//! Configuration management
//!
//! Settings come from a TOML file, with `PORTALD__<SECTION>__<KEY>` environment
//! variables layered on top. Every field has a default, so an empty or missing
//! file yields a working daemon.

use crate::detector::{DetectorConfig, StrategyId, StrategyTimings};
use crate::error::{DetectorError, Result};
use crate::probe::validate_probe_url;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Detection engine settings
    #[serde(default)]
    pub detector: DetectorSettings,

    /// Network watcher settings
    #[serde(default)]
    pub network: NetworkSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Detection engine settings. Durations are whole seconds unless suffixed.
#[derive(Debug, Deserialize, Clone)]
pub struct DetectorSettings {
    /// URL expected to answer 204 when the internet is reachable
    #[serde(default = "default_probe_url")]
    pub probe_url: String,

    /// Bound on a single probe
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout: u64,

    /// "backoff" or "fixed_interval"
    #[serde(default = "default_strategy")]
    pub strategy: String,

    #[serde(default)]
    pub startup_delay_ms: u64,

    #[serde(default = "default_base_delay")]
    pub base_delay: u64,

    /// Re-check interval once a network is known to be online
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(default = "default_fixed_interval")]
    pub fixed_interval: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff: u64,

    #[serde(default = "default_backoff_cap_exponent")]
    pub backoff_cap_exponent: u32,

    /// Consecutive probes without a response before reporting offline
    #[serde(default = "default_no_response_offline_threshold")]
    pub no_response_offline_threshold: u32,

    #[serde(default = "default_proxy_change_delay")]
    pub proxy_change_delay: u64,

    /// Start probing as soon as the daemon is up
    #[serde(default = "default_enable_on_start")]
    pub enable_on_start: bool,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            probe_url: default_probe_url(),
            attempt_timeout: default_attempt_timeout(),
            strategy: default_strategy(),
            startup_delay_ms: 0,
            base_delay: default_base_delay(),
            poll_interval: default_poll_interval(),
            fixed_interval: default_fixed_interval(),
            max_backoff: default_max_backoff(),
            backoff_cap_exponent: default_backoff_cap_exponent(),
            no_response_offline_threshold: default_no_response_offline_threshold(),
            proxy_change_delay: default_proxy_change_delay(),
            enable_on_start: default_enable_on_start(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSettings {
    /// How often the default network is re-read, in seconds
    #[serde(default = "default_network_poll_interval")]
    pub poll_interval: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            poll_interval: default_network_poll_interval(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_probe_url() -> String {
    "http://clients3.google.com/generate_204".to_string()
}

fn default_attempt_timeout() -> u64 {
    5
}

fn default_strategy() -> String {
    "backoff".to_string()
}

fn default_base_delay() -> u64 {
    3
}

fn default_poll_interval() -> u64 {
    30
}

fn default_fixed_interval() -> u64 {
    15
}

fn default_max_backoff() -> u64 {
    300
}

fn default_backoff_cap_exponent() -> u32 {
    6
}

fn default_no_response_offline_threshold() -> u32 {
    3
}

fn default_proxy_change_delay() -> u64 {
    1
}

fn default_enable_on_start() -> bool {
    true
}

fn default_network_poll_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from `path`, or from the first standard location that exists
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::search_paths().into_iter().find(|p| p.exists()),
        };

        let mut builder = ::config::Config::builder();
        match &file {
            Some(p) => {
                tracing::debug!("Loading config from: {}", p.display());
                builder = builder.add_source(::config::File::from(p.as_path()).required(true));
            }
            None => tracing::debug!("No config file found, using defaults"),
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("PORTALD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from("config.toml"),
            PathBuf::from("/etc/portald/config.toml"),
        ];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config/portald/config.toml"));
        }
        paths
    }

    /// Build the validated, immutable detector configuration
    pub fn detector_config(&self) -> Result<DetectorConfig> {
        let d = &self.detector;
        let config = DetectorConfig {
            probe_url: validate_probe_url(&d.probe_url)?,
            attempt_timeout: Duration::from_secs(d.attempt_timeout),
            strategy: d.strategy.parse::<StrategyId>()?,
            timings: StrategyTimings {
                startup_delay: Duration::from_millis(d.startup_delay_ms),
                base_delay: Duration::from_secs(d.base_delay),
                max_backoff: Duration::from_secs(d.max_backoff),
                backoff_cap_exponent: d.backoff_cap_exponent,
                poll_interval: Duration::from_secs(d.poll_interval),
                fixed_interval: Duration::from_secs(d.fixed_interval),
            },
            no_response_offline_threshold: d.no_response_offline_threshold,
            proxy_change_delay: Duration::from_secs(d.proxy_change_delay),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn network_poll_interval(&self) -> Result<Duration> {
        if self.network.poll_interval == 0 {
            return Err(DetectorError::InvalidTimings(
                "network.poll_interval must be greater than zero".into(),
            ));
        }
        Ok(Duration::from_secs(self.network.poll_interval))
    }
}
