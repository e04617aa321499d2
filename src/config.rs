// src/config.rs
//! Runtime configuration, read from a TOML file with environment overrides.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration for a local Redis.

use crate::{Priority, RelayError, Result, RetryPolicy};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub exchange: String,

    pub default_max_attempts: u32,
    pub max_attempts_limit: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_fraction: f64,

    /// Lower bounds of the priority tiers, ascending.
    pub tier_bounds: Vec<u8>,
    pub queue_max_length: Option<u64>,

    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub handler_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub visibility_timeout_secs: u64,
    pub maintenance_interval_ms: u64,
    pub reconcile_interval_secs: Option<u64>,
    pub stale_pending_secs: u64,
    pub max_reconnect_attempts: u32,

    pub types: BTreeMap<String, TypeConfig>,
}

/// Per job type overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TypeConfig {
    pub max_attempts: Option<u32>,
    pub handler_timeout_secs: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "taskrelay".to_string(),
            exchange: "jobs".to_string(),
            default_max_attempts: 3,
            max_attempts_limit: 10,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_fraction: 0.1,
            tier_bounds: (Priority::MIN.value()..=Priority::MAX.value()).collect(),
            queue_max_length: None,
            concurrency: 10,
            poll_interval_ms: 100,
            handler_timeout_secs: 300,
            shutdown_timeout_secs: 30,
            visibility_timeout_secs: 600,
            maintenance_interval_ms: 1_000,
            reconcile_interval_secs: Some(60),
            stale_pending_secs: 300,
            max_reconnect_attempts: 10,
            types: BTreeMap::new(),
        }
    }
}

impl RelayConfig {
    /// Load from `path` if it exists, then apply `TASKRELAY_*` overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| RelayError::Config(format!("reading {}: {e}", path.display())))?;
            Self::from_toml(&raw)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| RelayError::Config(e.to_string()))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T> {
            value
                .parse()
                .map_err(|_| RelayError::Config(format!("{key} has invalid value '{value}'")))
        }

        if let Some(v) = var("TASKRELAY_REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = var("TASKRELAY_EXCHANGE") {
            self.exchange = v;
        }
        if let Some(v) = var("TASKRELAY_MAX_ATTEMPTS") {
            self.default_max_attempts = parsed("TASKRELAY_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = var("TASKRELAY_BASE_DELAY_MS") {
            self.base_delay_ms = parsed("TASKRELAY_BASE_DELAY_MS", v)?;
        }
        if let Some(v) = var("TASKRELAY_MAX_DELAY_MS") {
            self.max_delay_ms = parsed("TASKRELAY_MAX_DELAY_MS", v)?;
        }
        if let Some(v) = var("TASKRELAY_JITTER") {
            self.jitter_fraction = parsed("TASKRELAY_JITTER", v)?;
        }
        if let Some(v) = var("TASKRELAY_CONCURRENCY") {
            self.concurrency = parsed("TASKRELAY_CONCURRENCY", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RelayError::Config(msg));

        if self.default_max_attempts == 0 || self.default_max_attempts > self.max_attempts_limit {
            return fail(format!(
                "default_max_attempts must be within 1..={}",
                self.max_attempts_limit
            ));
        }
        for (name, ty) in &self.types {
            if let Some(n) = ty.max_attempts {
                if n == 0 || n > self.max_attempts_limit {
                    return fail(format!("types.{name}.max_attempts must be within 1..={}", self.max_attempts_limit));
                }
            }
        }
        if !(0.0..1.0).contains(&self.jitter_fraction) {
            return fail("jitter_fraction must be within [0, 1)".to_string());
        }
        if self.base_delay_ms == 0 || self.max_delay_ms < self.base_delay_ms {
            return fail("max_delay_ms must be >= base_delay_ms > 0".to_string());
        }
        if self.tier_bounds.is_empty() || self.tier_bounds[0] != Priority::MIN.value() {
            return fail("tier_bounds must start at the minimum priority".to_string());
        }
        if self.tier_bounds.windows(2).any(|w| w[0] >= w[1])
            || self.tier_bounds.iter().any(|b| *b > Priority::MAX.value())
        {
            return fail("tier_bounds must be strictly ascending priorities".to_string());
        }
        if self.concurrency == 0 {
            return fail("concurrency must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter_fraction,
        )
    }

    pub fn max_attempts_for(&self, job_type: &str) -> u32 {
        self.types
            .get(job_type)
            .and_then(|t| t.max_attempts)
            .unwrap_or(self.default_max_attempts)
    }

    pub fn handler_timeout_for(&self, job_type: &str) -> Duration {
        let secs = self
            .types
            .get(job_type)
            .and_then(|t| t.handler_timeout_secs)
            .unwrap_or(self.handler_timeout_secs);
        Duration::from_secs(secs)
    }
}
