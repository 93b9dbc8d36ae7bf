//! Process configuration from environment inputs.
//!
//! A missing required input is a fatal startup error; optional inputs carry
//! defaults. Components read their slice of this struct and nothing else.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Model access for the enrich worker.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Required only by the enrich worker; other processes never touch it.
    pub api_key: Option<String>,
    pub base_url: String,
    pub model_name: String,
    pub timeout: Duration,
}

/// Per-stage retry budgets (`max_attempts`, 1-indexed attempts).
#[derive(Debug, Clone, Copy)]
pub struct WorkRetryConfig {
    pub fetch: u32,
    pub enrich: u32,
    pub publish: u32,
}

impl Default for WorkRetryConfig {
    fn default() -> Self {
        Self {
            fetch: 3,
            enrich: 3,
            publish: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_url: String,
    pub db_pool_size: u32,

    /// Partition count for `events.raw` (≥ 3 in deployment).
    pub events_partitions: u32,
    /// Partition count for the per-stage work topics.
    pub work_partitions: u32,

    pub outbox_batch_size: u32,
    pub outbox_poll_interval: Duration,
    pub outbox_max_consecutive_failures: u32,

    pub fetch_timeout: Duration,
    pub fetch_min_host_interval: Duration,
    pub enrich_truncate_chars: usize,

    pub work_retry: WorkRetryConfig,
    pub model: ModelConfig,
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = require("DATABASE_URL")?;
        let mut bus_url = require("BUS_URL")?;

        // Optional credentials are folded into the bus connection URL.
        if let (Ok(user), Ok(pass)) = (
            std::env::var("BUS_USERNAME"),
            std::env::var("BUS_PASSWORD"),
        ) {
            if let Some(rest) = bus_url.strip_prefix("redis://") {
                bus_url = format!("redis://{user}:{pass}@{rest}");
            }
        }

        Ok(Self {
            database_url,
            bus_url,
            db_pool_size: parse_or("DB_POOL_SIZE", 10)?,
            events_partitions: parse_or("EVENTS_PARTITIONS", 3)?,
            work_partitions: parse_or("WORK_PARTITIONS", 3)?,
            outbox_batch_size: parse_or("OUTBOX_BATCH_SIZE", 100)?,
            outbox_poll_interval: Duration::from_millis(parse_or("OUTBOX_POLL_INTERVAL_MS", 500)?),
            outbox_max_consecutive_failures: parse_or("OUTBOX_MAX_FAILURES", 5)?,
            fetch_timeout: Duration::from_secs(parse_or("FETCH_TIMEOUT_SECS", 30)?),
            fetch_min_host_interval: Duration::from_millis(parse_or(
                "FETCH_MIN_HOST_INTERVAL_MS",
                1_000,
            )?),
            enrich_truncate_chars: parse_or("ENRICH_TRUNCATE_CHARS", 32_000)?,
            work_retry: WorkRetryConfig {
                fetch: parse_or("FETCH_MAX_ATTEMPTS", 3)?,
                enrich: parse_or("ENRICH_MAX_ATTEMPTS", 3)?,
                publish: parse_or("PUBLISH_MAX_ATTEMPTS", 3)?,
            },
            model: ModelConfig {
                api_key: std::env::var("MODEL_API_KEY").ok(),
                base_url: std::env::var("MODEL_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                model_name: std::env::var("MODEL_NAME")
                    .unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                timeout: Duration::from_secs(parse_or("MODEL_TIMEOUT_SECS", 60)?),
            },
        })
    }

    /// The enrich worker cannot start without model credentials.
    pub fn require_model_api_key(&self) -> Result<&str, ConfigError> {
        self.model
            .api_key
            .as_deref()
            .ok_or(ConfigError::Missing("MODEL_API_KEY"))
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            name,
            value: raw.clone(),
        }),
        Err(_) => Ok(default),
    }
}
