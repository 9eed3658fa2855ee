//! Configuration for the cache client core
//!
//! Construction-time knobs only: concurrency cap, unary retry budget,
//! subscription reconnect pacing and queueing, and the default call deadline.
//! Strategies themselves are plugged in through `CacheClientBuilder`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Top-level client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Maximum number of unary calls in flight at once
    pub max_concurrent_requests: usize,

    /// Deadline applied to unary calls that do not carry their own, in milliseconds
    pub default_deadline_ms: Option<u64>,

    /// Value of the send-once `agent` header
    pub agent: String,

    /// Unary retry configuration
    pub retry: RetryConfig,

    /// Subscription reconnect configuration
    pub subscription: SubscriptionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            default_deadline_ms: Some(5_000),
            agent: format!("rust:{}:{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            retry: RetryConfig::default(),
            subscription: SubscriptionConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }

    /// Reject values that would make the client unusable.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(ClientError::config("max_concurrent_requests must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ClientError::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(ClientError::config("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.subscription.queue_capacity == 0 {
            return Err(ClientError::config("subscription.queue_capacity must be at least 1"));
        }
        if self.subscription.max_reconnect_attempts == Some(0) {
            return Err(ClientError::config(
                "subscription.max_reconnect_attempts must be at least 1 when set",
            ));
        }
        Ok(())
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: ClientConfig =
            toml::from_str(contents).map_err(|e| ClientError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Unary retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per logical call, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds
    pub base_delay_ms: u64,

    /// Growth factor between delays; 1.0 means a fixed delay
    pub backoff_multiplier: f64,

    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 1.0,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Subscription reconnect configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Delay before re-opening a failed stream, in milliseconds
    pub reconnect_delay_ms: u64,

    /// Consecutive failed reconnects tolerated before giving up; `None` keeps trying
    pub max_reconnect_attempts: Option<u32>,

    /// Capacity of the per-subscription event queue
    pub queue_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 500,
            max_reconnect_attempts: None,
            queue_capacity: 256,
        }
    }
}

impl SubscriptionConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ClientConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
        }
    }

    pub fn max_concurrent_requests(mut self, n: usize) -> Self {
        self.config.max_concurrent_requests = n;
        self
    }

    pub fn default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.config.default_deadline_ms = deadline.map(duration_millis);
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.config.agent = agent.into();
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry.max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry.base_delay_ms = duration_millis(delay);
        self
    }

    pub fn backoff_multiplier(mut self, factor: f64) -> Self {
        self.config.retry.backoff_multiplier = factor;
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.subscription.reconnect_delay_ms = duration_millis(delay);
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.subscription.max_reconnect_attempts = attempts;
        self
    }

    pub fn subscription_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.subscription.queue_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from environment variables, starting from defaults.
///
/// Unparseable values are ignored and the default is kept.
pub fn from_env() -> ClientConfig {
    let mut config = ClientConfig::default();

    if let Some(n) = env_parse::<usize>("TOWER_CACHE_MAX_CONCURRENT_REQUESTS") {
        config.max_concurrent_requests = n;
    }
    if let Some(ms) = env_parse::<u64>("TOWER_CACHE_DEADLINE_MS") {
        config.default_deadline_ms = Some(ms);
    }
    if let Some(n) = env_parse::<u32>("TOWER_CACHE_RETRY_MAX_ATTEMPTS") {
        config.retry.max_attempts = n;
    }
    if let Some(ms) = env_parse::<u64>("TOWER_CACHE_RETRY_DELAY_MS") {
        config.retry.base_delay_ms = ms;
    }
    if let Some(ms) = env_parse::<u64>("TOWER_CACHE_RECONNECT_DELAY_MS") {
        config.subscription.reconnect_delay_ms = ms;
    }

    config
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ClientConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ClientError::config(format!("reading config file: {e}")))?;
    ClientConfig::from_toml_str(&contents)
}
