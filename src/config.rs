//! Configuration management for fingate.
//!
//! Configuration is layered: the defaults of the selected [`Environment`]
//! profile, then an optional YAML file, then `FINGATE__SECTION__KEY`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{FinGateError, Result};
use crate::ratelimit::RateLimitPolicy;

/// Prefix for environment variable overrides.
const ENV_PREFIX: &str = "FINGATE";
/// Separator between prefix, section and key in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Deployment profile that selects default values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development
    #[default]
    Debug,
    /// Automated test runs
    Test,
    /// Production
    Release,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Environment::Debug),
            "test" => Ok(Environment::Test),
            "release" => Ok(Environment::Release),
            other => Err(format!(
                "unknown environment '{}', expected debug, test or release",
                other
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Debug => "debug",
            Environment::Test => "test",
            Environment::Release => "release",
        };
        f.write_str(name)
    }
}

/// Main configuration for the fingate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FinGateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// When false the gate admits every request and keeps no state
    #[serde(default)]
    pub enabled: bool,

    /// Sustained requests per second per client
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Bucket capacity per client
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Idle time after which a client's bucket is dropped
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold_secs: u64,

    /// How often the reaper sweeps idle clients
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

fn default_requests_per_second() -> f64 {
    200.0
}

fn default_burst() -> u32 {
    400
}

fn default_eviction_threshold() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    300
}

impl RateLimitingConfig {
    /// Profile defaults. Limiting is only switched on for release builds.
    pub fn for_environment(environment: Environment) -> Self {
        let (enabled, requests_per_second, burst) = match environment {
            Environment::Release => (true, 100.0, 200),
            Environment::Test => (false, 1000.0, 2000),
            Environment::Debug => (false, default_requests_per_second(), default_burst()),
        };

        Self {
            enabled,
            requests_per_second,
            burst,
            eviction_threshold_secs: default_eviction_threshold(),
            sweep_interval_secs: default_sweep_interval(),
            trust_forwarded_headers: false,
        }
    }

    /// Validated bucket policy.
    pub fn policy(&self) -> Result<RateLimitPolicy> {
        RateLimitPolicy::new(self.requests_per_second, self.burst)
    }

    pub fn eviction_threshold(&self) -> Duration {
        Duration::from_secs(self.eviction_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Check the values the gate and reaper depend on. A disabled
    /// configuration is always valid.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        self.policy()?;

        if self.sweep_interval_secs == 0 {
            return Err(FinGateError::Config(
                "rate_limiting.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable console output
    Pretty,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::for_environment(Environment::default())
    }
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

impl LoggingConfig {
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Release => Self {
                level: "info".to_string(),
                format: LogFormat::Json,
            },
            Environment::Test => Self {
                level: "error".to_string(),
                format: default_log_format(),
            },
            Environment::Debug => Self {
                level: default_log_level(),
                format: default_log_format(),
            },
        }
    }
}

impl FinGateConfig {
    /// Defaults for the given profile, without reading any source.
    pub fn for_environment(environment: Environment) -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limiting: RateLimitingConfig::for_environment(environment),
            logging: LoggingConfig::for_environment(environment),
        }
    }

    /// Load configuration for a profile, merging an optional file and the
    /// process environment on top of the profile defaults.
    pub fn load(environment: Environment, path: Option<&Path>) -> Result<Self> {
        let env_source = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true);

        Self::load_with(environment, path, env_source)
    }

    fn load_with(
        environment: Environment,
        path: Option<&Path>,
        env_source: config::Environment,
    ) -> Result<Self> {
        let defaults = Self::for_environment(environment);
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&defaults)?);

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: FinGateConfig = builder.add_source(env_source).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()
    }
}
