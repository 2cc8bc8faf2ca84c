//! A2A router configuration
//!
//! Static startup settings for the router: per-agent defaults, retry backoff,
//! circuit breaker thresholds and lifecycle intervals. Settings come from a
//! TOML file, then `A2A_*` environment variables override individual values.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Defaults applied to every agent unless overridden
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSettings {
    pub max_concurrency: u32,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub queue_high_water: usize,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            timeout_ms: 30_000,
            max_retries: 2,
            queue_high_water: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Trailing window for counting failures; 0 disables the window
    pub failure_window_ms: u64,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            failure_window_ms: 60_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn failure_window(&self) -> Option<Duration> {
        (self.failure_window_ms > 0).then(|| Duration::from_millis(self.failure_window_ms))
    }
}

/// Partial per-agent overrides; unset fields inherit from the defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_concurrency: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub queue_high_water: Option<usize>,
    pub failure_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub failure_window_ms: Option<u64>,
    pub half_open_max_calls: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    pub health_report_interval_secs: u64,
    pub slow_call_threshold_secs: u64,
    pub slow_call_check_interval_secs: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            health_report_interval_secs: 60,
            slow_call_threshold_secs: 30,
            slow_call_check_interval_secs: 15,
        }
    }
}

/// Fully resolved settings for one agent
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAgentSettings {
    pub max_concurrency: u32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub queue_high_water: usize,
    pub circuit_breaker: CircuitBreakerSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub defaults: DefaultsSettings,
    pub retry: RetrySettings,
    pub circuit_breaker: CircuitBreakerSettings,
    pub agents: HashMap<String, AgentSettings>,
    pub lifecycle: LifecycleSettings,
    pub shutdown_grace_ms: Option<u64>,
}

impl RouterSettings {
    /// Load settings from a TOML file, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut settings = Self::from_toml_str(&content)?;
        settings.apply_env_overrides()?;
        settings.validate()?;

        info!(
            path = %path.display(),
            agents = settings.agents.len(),
            "Loaded router configuration"
        );
        Ok(settings)
    }

    /// Parse settings from TOML without touching the environment
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Built-in defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_var(&lookup, "A2A_DEFAULT_CONCURRENCY")? {
            self.defaults.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_DEFAULT_TIMEOUT_MS")? {
            self.defaults.timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_DEFAULT_MAX_RETRIES")? {
            self.defaults.max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_QUEUE_HIGH_WATER")? {
            self.defaults.queue_high_water = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_BREAKER_FAILURE_THRESHOLD")? {
            self.circuit_breaker.failure_threshold = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_BREAKER_RESET_TIMEOUT_MS")? {
            self.circuit_breaker.reset_timeout_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_RETRY_BASE_DELAY_MS")? {
            self.retry.base_delay_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "A2A_RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay_ms = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.defaults.max_concurrency == 0 {
            return Err(ConfigError::Invalid("defaults.max_concurrency must be > 0".to_string()));
        }
        if self.defaults.timeout_ms == 0 {
            return Err(ConfigError::Invalid("defaults.timeout_ms must be > 0".to_string()));
        }
        if self.defaults.queue_high_water == 0 {
            return Err(ConfigError::Invalid("defaults.queue_high_water must be > 0".to_string()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.max_delay_ms must be >= retry.base_delay_ms".to_string(),
            ));
        }
        validate_breaker("circuit_breaker", &self.circuit_breaker)?;

        for name in self.agents.keys() {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("agent names must not be empty".to_string()));
            }
            let resolved = self.resolve_agent(name);
            if resolved.max_concurrency == 0 {
                return Err(ConfigError::Invalid(format!("agents.{name}.max_concurrency must be > 0")));
            }
            if resolved.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!("agents.{name}.timeout_ms must be > 0")));
            }
            if resolved.queue_high_water == 0 {
                return Err(ConfigError::Invalid(format!("agents.{name}.queue_high_water must be > 0")));
            }
            validate_breaker(&format!("agents.{name}"), &resolved.circuit_breaker)?;
        }
        Ok(())
    }

    /// Merge the defaults with any overrides configured for `agent`
    pub fn resolve_agent(&self, agent: &str) -> ResolvedAgentSettings {
        let overrides = self.agents.get(agent).cloned().unwrap_or_default();
        let breaker = &self.circuit_breaker;

        ResolvedAgentSettings {
            max_concurrency: overrides.max_concurrency.unwrap_or(self.defaults.max_concurrency),
            timeout: Duration::from_millis(overrides.timeout_ms.unwrap_or(self.defaults.timeout_ms)),
            max_retries: overrides.max_retries.unwrap_or(self.defaults.max_retries),
            queue_high_water: overrides.queue_high_water.unwrap_or(self.defaults.queue_high_water),
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: overrides.failure_threshold.unwrap_or(breaker.failure_threshold),
                reset_timeout_ms: overrides.reset_timeout_ms.unwrap_or(breaker.reset_timeout_ms),
                failure_window_ms: overrides.failure_window_ms.unwrap_or(breaker.failure_window_ms),
                half_open_max_calls: overrides.half_open_max_calls.unwrap_or(breaker.half_open_max_calls),
            },
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms.unwrap_or(10_000))
    }
}

fn validate_breaker(prefix: &str, breaker: &CircuitBreakerSettings) -> Result<()> {
    if breaker.failure_threshold == 0 {
        return Err(ConfigError::Invalid(format!("{prefix}.failure_threshold must be > 0")));
    }
    if breaker.half_open_max_calls == 0 {
        return Err(ConfigError::Invalid(format!("{prefix}.half_open_max_calls must be > 0")));
    }
    if breaker.reset_timeout_ms == 0 {
        warn!(prefix, "reset_timeout_ms is 0, breaker will half-open immediately after tripping");
    }
    Ok(())
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw.clone(),
            })?;
            debug!(key, value = %raw, "Applied environment override");
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
