//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Default backend endpoint.
pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws/code-runner/";

/// Floor for any reconnect delay.
const MIN_DELAY_MS: u64 = 10;

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound for any delay.
    pub max_delay_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: u32,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Fixed delay between attempts.
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Self {
            initial_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1,
            max_attempts: None,
        }
    }

    /// Limit the number of consecutive attempts.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier.max(1)).saturating_pow(exponent);
        let ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
            .max(MIN_DELAY_MS);
        Duration::from_millis(ms)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    #[must_use]
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Where to connect and how to reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Backend address.
    pub url: String,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ConnectionConfig {
    /// Config for a given URL with default backoff.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Read overrides from `CODERUN_*` environment variables.
    ///
    /// # Errors
    /// Returns error if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup, starting from defaults.
    ///
    /// # Errors
    /// Returns error if a numeric value does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("CODERUN_URL") {
            config.url = url;
        }
        if let Some(ms) = parse_var(&lookup, "CODERUN_RECONNECT_INITIAL_MS")? {
            config.reconnect.initial_delay_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "CODERUN_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay_ms = ms;
        }
        if let Some(max) = parse_var(&lookup, "CODERUN_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = Some(max);
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value })
        })
        .transpose()
}
