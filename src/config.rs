//! `config.toml` loading
//!
//! Every key is optional. Missing keys keep the engine defaults, and CLI
//! flags override whatever the file says.
//!
//! ```toml
//! jobs = 8
//! provider_timeout_secs = 120
//! callback_timeout_secs = 900
//! sweep_interval_ms = 1000
//! database = "~/infra/strata.db"
//!
//! [retry]
//! max_attempts = 5
//! base_delay_ms = 250
//! backoff_factor = 2.0
//! max_delay_ms = 10000
//!
//! [callback]
//! bind = "127.0.0.1:8787"
//! public_url = "https://strata.example.com/v1/callbacks"
//! ```

use anyhow::{Context, Result, bail};
use orchestrator::{EngineOptions, RetryConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths;

/// Default callback listener address
pub const DEFAULT_CALLBACK_BIND: &str = "127.0.0.1:8787";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub jobs: Option<usize>,
    pub provider_timeout_secs: Option<u64>,
    pub callback_timeout_secs: Option<u64>,
    pub sweep_interval_ms: Option<u64>,
    /// Database path, `~` expanded
    pub database: Option<String>,
    pub retry: RetrySection,
    pub callback: CallbackSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub backoff_factor: Option<f64>,
    pub max_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallbackSection {
    /// Listen address for the callback endpoint
    pub bind: Option<String>,
    /// URL custom providers should call back on, if it differs from the
    /// listen address (reverse proxy, tunnel)
    pub public_url: Option<String>,
}

impl Config {
    /// Load `config.toml` from the config directory. A missing file is an
    /// empty config.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_dir()?.join("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(factor) = self.retry.backoff_factor
            && !(factor.is_finite() && factor >= 1.0)
        {
            bail!("retry.backoff_factor must be a finite number of at least 1.0, got {factor}");
        }
        Ok(())
    }

    /// Database file: config value, else the state directory default
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(paths::expand(path)),
            None => paths::database_path(),
        }
    }

    pub fn callback_bind(&self) -> Result<SocketAddr> {
        let bind = self.callback.bind.as_deref().unwrap_or(DEFAULT_CALLBACK_BIND);
        bind.parse()
            .with_context(|| format!("Invalid callback bind address: {bind}"))
    }

    /// Engine options with this config layered over the defaults
    pub fn engine_options(&self) -> EngineOptions {
        let defaults = EngineOptions::default();
        let retry_defaults = RetryConfig::default();

        let retry = RetryConfig {
            max_attempts: self.retry.max_attempts.unwrap_or(retry_defaults.max_attempts),
            base_delay: self
                .retry
                .base_delay_ms
                .map_or(retry_defaults.base_delay, Duration::from_millis),
            backoff_factor: self.retry.backoff_factor.unwrap_or(retry_defaults.backoff_factor),
            max_delay: self
                .retry
                .max_delay_ms
                .map_or(retry_defaults.max_delay, Duration::from_millis),
        };

        let options = EngineOptions {
            jobs: self.jobs.unwrap_or(defaults.jobs).max(1),
            provider_timeout: self
                .provider_timeout_secs
                .map_or(defaults.provider_timeout, Duration::from_secs),
            sweep_interval: self
                .sweep_interval_ms
                .map_or(defaults.sweep_interval, Duration::from_millis),
            retry,
            ..defaults
        };
        match self.callback_timeout_secs {
            Some(secs) => options.with_callback_timeout(Duration::from_secs(secs)),
            None => options,
        }
    }
}
