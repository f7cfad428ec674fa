use serde::{Deserialize, Serialize};
use std::{
    fmt,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::Level;

use wagerbook_engine::{EngineConfig, ValidatedEngineConfig, WorkerConfig};

pub mod api;
pub mod defaults;

/// Configuration for the wagerbook node.
#[derive(Deserialize, Serialize)]
pub struct Config {
    /// Bearer token payment processors must present on the notification webhook.
    pub webhook_token: String,

    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("webhook_token must be at least {min} characters")]
    InvalidWebhookToken { min: usize },
    #[error("max_backoff_ms ({max}) must be >= initial_backoff_ms ({initial})")]
    InvalidBackoff { initial: u64, max: u64 },
    #[error(transparent)]
    Engine(#[from] wagerbook_engine::ConfigError),
}

pub struct ValidatedConfig {
    pub webhook_token: String,
    pub port: u16,
    pub database: PathBuf,
    pub log_level: Level,
    pub log_json: bool,
    pub workers: NonZeroUsize,
    pub queue_size: NonZeroUsize,
    pub max_attempts: NonZeroU32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub sweep_interval: Duration,
    pub shutdown_grace: Duration,
    pub engine: ValidatedEngineConfig,
}

impl ValidatedConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.workers.get(),
            queue_capacity: self.queue_size.get(),
            max_attempts: self.max_attempts.get(),
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field("webhook_token", &"<redacted>")
            .field("port", &cfg.port)
            .field("database", &cfg.database)
            .field("log_level", &cfg.log_level)
            .field("log_json", &cfg.log_json)
            .field("workers", &cfg.workers)
            .field("queue_size", &cfg.queue_size)
            .field("max_attempts", &cfg.max_attempts)
            .field("initial_backoff_ms", &cfg.initial_backoff_ms)
            .field("max_backoff_ms", &cfg.max_backoff_ms)
            .field("sweep_interval_ms", &cfg.sweep_interval_ms)
            .field("shutdown_grace_ms", &cfg.shutdown_grace_ms)
            .field("engine", &cfg.engine)
            .finish()
    }
}

fn default_port() -> u16 {
    defaults::DEFAULT_PORT
}

fn default_database() -> String {
    defaults::DEFAULT_DATABASE.to_string()
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_workers() -> usize {
    defaults::DEFAULT_WORKERS
}

fn default_queue_size() -> usize {
    defaults::DEFAULT_QUEUE_SIZE
}

fn default_max_attempts() -> u32 {
    defaults::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    defaults::DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    defaults::DEFAULT_MAX_BACKOFF_MS
}

fn default_sweep_interval_ms() -> u64 {
    defaults::DEFAULT_SWEEP_INTERVAL_MS
}

fn default_shutdown_grace_ms() -> u64 {
    defaults::DEFAULT_SHUTDOWN_GRACE_MS
}

fn nonzero_usize(field: &'static str, value: usize) -> Result<NonZeroUsize, ConfigError> {
    NonZeroUsize::new(value).ok_or(ConfigError::InvalidNonZero {
        field,
        value: value as u64,
    })
}

fn nonzero_u32(field: &'static str, value: u32) -> Result<NonZeroU32, ConfigError> {
    NonZeroU32::new(value).ok_or(ConfigError::InvalidNonZero {
        field,
        value: u64::from(value),
    })
}

fn ensure_nonzero_u64(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.webhook_token.trim().len() < defaults::MIN_WEBHOOK_TOKEN_LEN {
            return Err(ConfigError::InvalidWebhookToken {
                min: defaults::MIN_WEBHOOK_TOKEN_LEN,
            });
        }
        let workers = nonzero_usize("workers", self.workers)?;
        let queue_size = nonzero_usize("queue_size", self.queue_size)?;
        let max_attempts = nonzero_u32("max_attempts", self.max_attempts)?;
        ensure_nonzero_u64("initial_backoff_ms", self.initial_backoff_ms)?;
        ensure_nonzero_u64("sweep_interval_ms", self.sweep_interval_ms)?;
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::InvalidBackoff {
                initial: self.initial_backoff_ms,
                max: self.max_backoff_ms,
            });
        }
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        let engine = self.engine.validate()?;

        Ok(ValidatedConfig {
            webhook_token: self.webhook_token.trim().to_string(),
            port: self.port,
            database: PathBuf::from(self.database),
            log_level,
            log_json: self.log_json,
            workers,
            queue_size,
            max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            engine,
        })
    }
}
