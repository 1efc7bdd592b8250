//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Timeout for request-path store operations, in milliseconds
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,

    /// Timeout for sweeper batch operations, in milliseconds
    #[serde(default = "default_sweep_timeout")]
    pub sweep_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            check_timeout_ms: default_check_timeout(),
            sweep_timeout_ms: default_sweep_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_check_timeout() -> u64 {
    250
}

fn default_sweep_timeout() -> u64 {
    5000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum requests allowed per window
    #[serde(default = "default_limit")]
    pub limit: u32,

    /// Window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Prefix for all rate limit keys in the shared store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the sweeper reclaims stale keys, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,

    /// How many keys the sweeper requests per scan page
    #[serde(default = "default_sweep_page_size")]
    pub sweep_page_size: usize,

    /// What to do with a request when the store cannot be evaluated
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_seconds: default_window_seconds(),
            key_prefix: default_key_prefix(),
            sweep_interval_seconds: default_sweep_interval(),
            sweep_page_size: default_sweep_page_size(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl LimiterConfig {
    /// Window length in milliseconds.
    pub fn window_ms(&self) -> i64 {
        self.window_seconds as i64 * 1000
    }
}

fn default_limit() -> u32 {
    1000
}

fn default_window_seconds() -> u64 {
    60
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_page_size() -> usize {
    100
}

/// Policy for handling requests when the shared store is unreachable.
///
/// Fail-open admits traffic and logs the failure, which is appropriate when
/// rate limiting is a fairness control. Fail-closed rejects traffic, which is
/// required wherever admission control is a security control.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    FailOpen,
    FailClosed,
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configured values form a usable limiter.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.limit == 0 {
            return Err(TurnstileError::Config("limit must be greater than zero".into()));
        }
        if self.limiter.window_seconds == 0 {
            return Err(TurnstileError::Config(
                "window_seconds must be greater than zero".into(),
            ));
        }
        if self.limiter.sweep_interval_seconds == 0 {
            return Err(TurnstileError::Config(
                "sweep_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.limiter.sweep_page_size == 0 {
            return Err(TurnstileError::Config(
                "sweep_page_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
