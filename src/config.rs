// src/config.rs
use std::env;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::Duration;
use thiserror::Error;

use crate::scheduler::{RetryPolicy, WorkerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be a valid number, got '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs on the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    pub max_connections: u32,
    pub worker: WorkerConfig,
    pub notify_webhook_url: Option<String>,
}

impl Config {
    /// Read the configuration from the process environment (after `.env`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let poll_interval: u64 = parse(&lookup, "CLOSURE_POLL_INTERVAL_SECS", 5)?;
        let max_attempts: u32 = parse(&lookup, "CLOSURE_MAX_ATTEMPTS", 5)?;
        let backoff_base: i64 = parse(&lookup, "CLOSURE_BACKOFF_BASE_SECS", 2)?;
        let backoff_max: i64 = parse(&lookup, "CLOSURE_BACKOFF_MAX_SECS", 300)?;
        let lease: i64 = parse(&lookup, "CLOSURE_LEASE_SECS", 60)?;

        if poll_interval == 0 {
            return Err(ConfigError::Zero("CLOSURE_POLL_INTERVAL_SECS"));
        }
        if max_attempts == 0 {
            return Err(ConfigError::Zero("CLOSURE_MAX_ATTEMPTS"));
        }
        if lease <= 0 {
            return Err(ConfigError::Zero("CLOSURE_LEASE_SECS"));
        }

        Ok(Self {
            database_url: non_empty("DATABASE_URL"),
            port: parse(&lookup, "PORT", 3030)?,
            max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
            worker: WorkerConfig {
                poll_interval: StdDuration::from_secs(poll_interval),
                lease: Duration::seconds(lease),
                retry: RetryPolicy {
                    max_attempts,
                    base_delay: Duration::seconds(backoff_base.max(0)),
                    max_delay: Duration::seconds(backoff_max.max(backoff_base).max(0)),
                },
                ..WorkerConfig::default()
            },
            notify_webhook_url: non_empty("NOTIFY_WEBHOOK_URL"),
        })
    }
}

fn parse<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}
