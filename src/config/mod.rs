//! Idempotency engine configuration.
//!
//! Every knob can be set from a TOML document, from `RTTP_IDEMPOTENCY_*`
//! environment variables, or in code through the `with_*` builders. Durations
//! use humantime syntax (`"48h"`, `"100ms"`).
//!
//! ```toml
//! header_name = "Idempotency-Key"
//! ttl = "48h"
//! max_entries = 500
//! max_bytes = 2097152
//! poll_interval = "100ms"
//! in_flight_timeout = "60s"
//! match_query = true
//! match_body = true
//! cache_server_errors = false
//! ```

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "RTTP_IDEMPOTENCY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("header_name must not be blank")]
    EmptyHeader,
}

/// Tunables for [`IdempotencyEngine`](crate::idempotency::IdempotencyEngine).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdempotencyConfig {
    /// Request header carrying the idempotency token.
    pub header_name: String,

    /// Absolute lifetime of a stored response, measured from insertion.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum number of stored responses.
    pub max_entries: usize,

    /// Budget for the summed size estimate of all stored responses.
    pub max_bytes: usize,

    /// Upper bound between re-checks while waiting on an in-flight owner.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// How long an owner may hold a key before it is force-released.
    #[serde(with = "humantime_serde")]
    pub in_flight_timeout: Duration,

    /// Include the query string in request identity.
    pub match_query: bool,

    /// Include a digest of the request body in request identity.
    pub match_body: bool,

    /// Store 5xx responses for replay instead of letting the next arrival retry.
    pub cache_server_errors: bool,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            header_name: "Idempotency-Key".to_owned(),
            ttl: Duration::from_secs(48 * 60 * 60),
            max_entries: 500,
            max_bytes: 2 * 1024 * 1024,
            poll_interval: Duration::from_millis(100),
            in_flight_timeout: Duration::from_secs(60),
            match_query: true,
            match_body: true,
            cache_server_errors: false,
        }
    }
}

impl IdempotencyConfig {
    /// Parses a TOML document; omitted fields keep their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Toml`] for malformed input or unknown fields, otherwise
    /// whatever [`validate`](Self::validate) rejects.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env_with(|var| std::env::var(var).ok())
    }

    /// Overlays `RTTP_IDEMPOTENCY_*` values obtained through `lookup`.
    ///
    /// Taking the lookup as a closure keeps the overlay testable without
    /// mutating the process environment.
    pub fn apply_env_with<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let var = format!("{ENV_PREFIX}{suffix}");
            lookup(&var).map(|value| (var, value))
        };

        if let Some((_, value)) = get("HEADER") {
            self.header_name = value;
        }
        if let Some((var, value)) = get("TTL") {
            self.ttl = parse_duration(var, value)?;
        }
        if let Some((var, value)) = get("MAX_ENTRIES") {
            self.max_entries = parse_number(var, value)?;
        }
        if let Some((var, value)) = get("MAX_BYTES") {
            self.max_bytes = parse_number(var, value)?;
        }
        if let Some((var, value)) = get("POLL_INTERVAL") {
            self.poll_interval = parse_duration(var, value)?;
        }
        if let Some((var, value)) = get("IN_FLIGHT_TIMEOUT") {
            self.in_flight_timeout = parse_duration(var, value)?;
        }
        if let Some((var, value)) = get("MATCH_QUERY") {
            self.match_query = parse_bool(var, value)?;
        }
        if let Some((var, value)) = get("MATCH_BODY") {
            self.match_body = parse_bool(var, value)?;
        }
        if let Some((var, value)) = get("CACHE_SERVER_ERRORS") {
            self.cache_server_errors = parse_bool(var, value)?;
        }

        self.validate()?;
        Ok(self)
    }

    /// Rejects budgets and intervals that would disable the engine silently.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyHeader`] for a blank `header_name`,
    /// [`ConfigError::Zero`] naming the first zero budget or interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |field| Err(ConfigError::Zero { field });
        if self.header_name.trim().is_empty() {
            return Err(ConfigError::EmptyHeader);
        }
        if self.ttl.is_zero() {
            return zero("ttl");
        }
        if self.max_entries == 0 {
            return zero("max_entries");
        }
        if self.max_bytes == 0 {
            return zero("max_bytes");
        }
        if self.poll_interval.is_zero() {
            return zero("poll_interval");
        }
        if self.in_flight_timeout.is_zero() {
            return zero("in_flight_timeout");
        }
        Ok(())
    }

    #[must_use]
    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_in_flight_timeout(mut self, timeout: Duration) -> Self {
        self.in_flight_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_match_query(mut self, match_query: bool) -> Self {
        self.match_query = match_query;
        self
    }

    #[must_use]
    pub fn with_match_body(mut self, match_body: bool) -> Self {
        self.match_body = match_body;
        self
    }

    #[must_use]
    pub fn with_cache_server_errors(mut self, cache: bool) -> Self {
        self.cache_server_errors = cache;
        self
    }
}

fn parse_duration(var: String, value: String) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value.trim()).map_err(|e| ConfigError::Env {
        reason: e.to_string(),
        var,
        value,
    })
}

fn parse_number(var: String, value: String) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|e: std::num::ParseIntError| ConfigError::Env {
        reason: e.to_string(),
        var,
        value,
    })
}

fn parse_bool(var: String, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Env {
            reason: "expected a boolean".to_owned(),
            var,
            value,
        }),
    }
}
