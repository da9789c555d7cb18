//! # Session Configuration
//!
//! [`ParleyConfig`] gathers the settings of every component a session owns.
//! Values start from defaults, can be loaded from a TOML file and can be
//! overridden from the environment. Durations are human-readable strings
//! (`"250ms"`, `"2s"`, `"1m"`).
//!
//! ## File format
//!
//! ```toml
//! [bus]
//! inbox_capacity = 64
//! dispatch_timeout = "2s"
//!
//! [gateway]
//! call_timeout = "10s"
//! max_retries = 3
//!
//! [orchestrator]
//! turn_timeout = "30s"
//! max_consecutive_timeouts = 2
//!
//! [runtime]
//! max_tool_rounds = 4
//! ```
//!
//! ## Environment Variables
//!
//! ### Bus
//! - `PARLEY_INBOX_CAPACITY` - Bound of each agent inbox (default: 64)
//! - `PARLEY_DISPATCH_TIMEOUT` - Wait on a full inbox before failing (default: 2s)
//! - `PARLEY_SUBMISSION_CAPACITY` - Bound of each conversation's submission channel (default: 256)
//! - `PARLEY_DLQ_MAX_SIZE` - Dead letter queue bound (default: 10000)
//!
//! ### Gateway
//! - `PARLEY_CALL_TIMEOUT` - Caller wait bound (default: 10s)
//! - `PARLEY_ATTEMPT_TIMEOUT` - Single attempt bound (default: 5s)
//! - `PARLEY_EXECUTION_CEILING` - Whole execution bound (default: 60s)
//! - `PARLEY_MAX_RETRIES` - Retries of transient failures (default: 3)
//! - `PARLEY_BACKOFF_BASE` - First retry delay (default: 100ms)
//! - `PARLEY_BACKOFF_MAX` - Retry delay cap (default: 5s)
//! - `PARLEY_CACHE_TTL` - How long a finished execution answers its key (default: 10m)
//! - `PARLEY_LEDGER_CAPACITY` - Ledger entries kept per requester (default: 256)
//!
//! ### Orchestrator
//! - `PARLEY_TURN_TIMEOUT` - Wait for a speaker's submission (default: 30s)
//! - `PARLEY_SELECTION_TIMEOUT` - Wait for a coordinator's selection (default: 5s)
//! - `PARLEY_MAX_CONSECUTIVE_TIMEOUTS` - Missed turns before removal (default: 2)
//!
//! ### Runtime
//! - `PARLEY_MAX_TOOL_ROUNDS` - Tool calls per step (default: 4)
//! - `PARLEY_CONTEXT_WINDOW` - Perceived messages kept per conversation (default: 32)
//! - `PARLEY_DEDUP_WINDOW` - Delivery keys remembered per agent (default: 1024)

use std::path::Path;
use std::time::Duration;

use parley_mesh::BusConfig;
use parley_tools::GatewayConfig;
use serde::Deserialize;

use crate::orchestrator::OrchestratorConfig;
use crate::runtime::RuntimeConfig;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable '{key}': {message}")]
    InvalidEnvVar { key: String, message: String },

    #[error("Invalid configuration file: {0}")]
    Parse(String),

    #[error("Cannot read configuration file '{path}': {message}")]
    Io { path: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Settings of every component a session owns
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParleyConfig {
    pub bus: BusConfig,
    pub gateway: GatewayConfig,
    pub orchestrator: OrchestratorConfig,
    pub runtime: RuntimeConfig,
}

impl ParleyConfig {
    /// Defaults overridden by `PARLEY_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        ParleyConfigBuilder::from_env()?.build()
    }
}

/// Builder for [`ParleyConfig`] with file and environment support
#[derive(Debug, Clone, Default)]
pub struct ParleyConfigBuilder {
    config: ParleyConfig,
}

impl ParleyConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Load configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut builder = Self::default();
        file.apply(&mut builder.config)?;
        Ok(builder)
    }

    /// Apply `PARLEY_*` overrides from the process environment
    pub fn with_env(self) -> Result<Self, ConfigError> {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `PARLEY_*` overrides read through `lookup`
    pub fn with_env_from(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup: &lookup };
        let config = &mut self.config;

        // Bus
        if let Some(v) = env.usize("PARLEY_INBOX_CAPACITY")? {
            config.bus.inbox_capacity = v;
        }
        if let Some(v) = env.duration("PARLEY_DISPATCH_TIMEOUT")? {
            config.bus.dispatch_timeout = v;
        }
        if let Some(v) = env.usize("PARLEY_SUBMISSION_CAPACITY")? {
            config.bus.submission_capacity = v;
        }
        if let Some(v) = env.usize("PARLEY_DLQ_MAX_SIZE")? {
            config.bus.dlq.max_size = v;
        }

        // Gateway
        if let Some(v) = env.duration("PARLEY_CALL_TIMEOUT")? {
            config.gateway.call_timeout = v;
        }
        if let Some(v) = env.duration("PARLEY_ATTEMPT_TIMEOUT")? {
            config.gateway.attempt_timeout = v;
        }
        if let Some(v) = env.duration("PARLEY_EXECUTION_CEILING")? {
            config.gateway.execution_ceiling = v;
        }
        if let Some(v) = env.u32("PARLEY_MAX_RETRIES")? {
            config.gateway.max_retries = v;
        }
        if let Some(v) = env.duration("PARLEY_BACKOFF_BASE")? {
            config.gateway.backoff_base = v;
        }
        if let Some(v) = env.duration("PARLEY_BACKOFF_MAX")? {
            config.gateway.backoff_max = v;
        }
        if let Some(v) = env.duration("PARLEY_CACHE_TTL")? {
            config.gateway.cache_ttl = v;
        }
        if let Some(v) = env.usize("PARLEY_LEDGER_CAPACITY")? {
            config.gateway.ledger_capacity = v;
        }

        // Orchestrator
        if let Some(v) = env.duration("PARLEY_TURN_TIMEOUT")? {
            config.orchestrator.turn_timeout = v;
        }
        if let Some(v) = env.duration("PARLEY_SELECTION_TIMEOUT")? {
            config.orchestrator.selection_timeout = v;
        }
        if let Some(v) = env.u32("PARLEY_MAX_CONSECUTIVE_TIMEOUTS")? {
            config.orchestrator.max_consecutive_timeouts = v;
        }

        // Runtime
        if let Some(v) = env.u32("PARLEY_MAX_TOOL_ROUNDS")? {
            config.runtime.max_tool_rounds = v;
        }
        if let Some(v) = env.usize("PARLEY_CONTEXT_WINDOW")? {
            config.runtime.context_window = v;
        }
        if let Some(v) = env.usize("PARLEY_DEDUP_WINDOW")? {
            config.runtime.dedup_window = v;
        }

        Ok(self)
    }

    #[must_use]
    pub fn bus(mut self, bus: BusConfig) -> Self {
        self.config.bus = bus;
        self
    }

    #[must_use]
    pub fn gateway(mut self, gateway: GatewayConfig) -> Self {
        self.config.gateway = gateway;
        self
    }

    #[must_use]
    pub fn orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.config.orchestrator = orchestrator;
        self
    }

    #[must_use]
    pub fn runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.config.runtime = runtime;
        self
    }

    /// Validate and build the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the configuration is invalid.
    pub fn build(self) -> Result<ParleyConfig, ConfigError> {
        self.validate()?;
        Ok(self.config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let config = &self.config;
        config
            .bus
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        let gateway = &config.gateway;
        if gateway.call_timeout.is_zero() {
            return Err(invalid("gateway.call_timeout must be greater than 0"));
        }
        if gateway.attempt_timeout.is_zero() {
            return Err(invalid("gateway.attempt_timeout must be greater than 0"));
        }
        if gateway.execution_ceiling < gateway.attempt_timeout {
            return Err(invalid(
                "gateway.execution_ceiling must be >= gateway.attempt_timeout",
            ));
        }
        if gateway.backoff_max < gateway.backoff_base {
            return Err(invalid("gateway.backoff_max must be >= gateway.backoff_base"));
        }
        if gateway.cache_ttl.is_zero() {
            return Err(invalid("gateway.cache_ttl must be greater than 0"));
        }

        let orchestrator = &config.orchestrator;
        if orchestrator.turn_timeout.is_zero() {
            return Err(invalid("orchestrator.turn_timeout must be greater than 0"));
        }
        if orchestrator.selection_timeout.is_zero() {
            return Err(invalid(
                "orchestrator.selection_timeout must be greater than 0",
            ));
        }
        if orchestrator.max_consecutive_timeouts == 0 {
            return Err(invalid(
                "orchestrator.max_consecutive_timeouts must be greater than 0",
            ));
        }

        let runtime = &config.runtime;
        if runtime.context_window == 0 {
            return Err(invalid("runtime.context_window must be greater than 0"));
        }
        if runtime.dedup_window == 0 {
            return Err(invalid("runtime.dedup_window must be greater than 0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::InvalidEnvVar {
        key: key.to_string(),
        message: format!("invalid duration '{value}': {e}"),
    })
}

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn parsed<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(val) => val
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|e| ConfigError::InvalidEnvVar {
                    key: key.to_string(),
                    message: format!("invalid value '{val}': {e}"),
                }),
            None => Ok(None),
        }
    }

    fn usize(&self, key: &str) -> Result<Option<usize>, ConfigError> {
        self.parsed(key)
    }

    fn u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        self.parsed(key)
    }

    fn duration(&self, key: &str) -> Result<Option<Duration>, ConfigError> {
        (self.lookup)(key)
            .map(|val| parse_duration(key, val.trim()))
            .transpose()
    }
}

// TOML file layout; every field is optional and overrides the default.

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    bus: BusSection,
    #[serde(default)]
    gateway: GatewaySection,
    #[serde(default)]
    orchestrator: OrchestratorSection,
    #[serde(default)]
    runtime: RuntimeSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BusSection {
    inbox_capacity: Option<usize>,
    dispatch_timeout: Option<String>,
    submission_capacity: Option<usize>,
    dlq_max_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct GatewaySection {
    call_timeout: Option<String>,
    attempt_timeout: Option<String>,
    execution_ceiling: Option<String>,
    max_retries: Option<u32>,
    backoff_base: Option<String>,
    backoff_max: Option<String>,
    cache_ttl: Option<String>,
    ledger_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OrchestratorSection {
    turn_timeout: Option<String>,
    selection_timeout: Option<String>,
    max_consecutive_timeouts: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuntimeSection {
    max_tool_rounds: Option<u32>,
    context_window: Option<usize>,
    dedup_window: Option<usize>,
}

fn file_duration(field: &str, value: &Option<String>) -> Result<Option<Duration>, ConfigError> {
    value
        .as_deref()
        .map(|v| {
            humantime::parse_duration(v)
                .map_err(|e| ConfigError::Parse(format!("{field}: invalid duration '{v}': {e}")))
        })
        .transpose()
}

impl ConfigFile {
    fn apply(self, config: &mut ParleyConfig) -> Result<(), ConfigError> {
        let bus = self.bus;
        if let Some(v) = bus.inbox_capacity {
            config.bus.inbox_capacity = v;
        }
        if let Some(v) = file_duration("bus.dispatch_timeout", &bus.dispatch_timeout)? {
            config.bus.dispatch_timeout = v;
        }
        if let Some(v) = bus.submission_capacity {
            config.bus.submission_capacity = v;
        }
        if let Some(v) = bus.dlq_max_size {
            config.bus.dlq.max_size = v;
        }

        let gateway = self.gateway;
        if let Some(v) = file_duration("gateway.call_timeout", &gateway.call_timeout)? {
            config.gateway.call_timeout = v;
        }
        if let Some(v) = file_duration("gateway.attempt_timeout", &gateway.attempt_timeout)? {
            config.gateway.attempt_timeout = v;
        }
        if let Some(v) = file_duration("gateway.execution_ceiling", &gateway.execution_ceiling)? {
            config.gateway.execution_ceiling = v;
        }
        if let Some(v) = gateway.max_retries {
            config.gateway.max_retries = v;
        }
        if let Some(v) = file_duration("gateway.backoff_base", &gateway.backoff_base)? {
            config.gateway.backoff_base = v;
        }
        if let Some(v) = file_duration("gateway.backoff_max", &gateway.backoff_max)? {
            config.gateway.backoff_max = v;
        }
        if let Some(v) = file_duration("gateway.cache_ttl", &gateway.cache_ttl)? {
            config.gateway.cache_ttl = v;
        }
        if let Some(v) = gateway.ledger_capacity {
            config.gateway.ledger_capacity = v;
        }

        let orchestrator = self.orchestrator;
        if let Some(v) = file_duration("orchestrator.turn_timeout", &orchestrator.turn_timeout)? {
            config.orchestrator.turn_timeout = v;
        }
        if let Some(v) =
            file_duration("orchestrator.selection_timeout", &orchestrator.selection_timeout)?
        {
            config.orchestrator.selection_timeout = v;
        }
        if let Some(v) = orchestrator.max_consecutive_timeouts {
            config.orchestrator.max_consecutive_timeouts = v;
        }

        let runtime = self.runtime;
        if let Some(v) = runtime.max_tool_rounds {
            config.runtime.max_tool_rounds = v;
        }
        if let Some(v) = runtime.context_window {
            config.runtime.context_window = v;
        }
        if let Some(v) = runtime.dedup_window {
            config.runtime.dedup_window = v;
        }
        Ok(())
    }
}
