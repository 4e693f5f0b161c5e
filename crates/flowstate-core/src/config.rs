// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Tuning of one executor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Partition of instances this executor claims.
    pub executor_group: String,
    /// Maximum concurrently running instance processors.
    pub thread_count: usize,
    /// Sleep between polls when no work was claimed.
    pub poll_interval: Duration,
    /// Local queue length above which the dispatcher stops claiming.
    pub queue_threshold: usize,
    /// Consecutive immediate transitions before a short delay is forced.
    pub busy_loop_limit: u32,
    /// Time after the last keepalive at which this executor counts as dead.
    pub executor_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Activation lag that is logged as a warning.
    pub lag_warning: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let thread_count = default_thread_count();
        Self {
            executor_group: "flowstate".to_string(),
            thread_count,
            poll_interval: Duration::from_secs(2),
            queue_threshold: thread_count,
            busy_loop_limit: 100,
            executor_timeout: Duration::from_secs(900),
            keepalive_interval: Duration::from_secs(60),
            lag_warning: Duration::from_secs(60),
        }
    }
}

fn default_thread_count() -> usize {
    std::thread::available_parallelism()
        .map(|cpus| cpus.get() * 2)
        .unwrap_or(8)
}

/// Flowstate executor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `FLOWSTATE_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `FLOWSTATE_EXECUTOR_GROUP`: executor group (default: flowstate)
    /// - `FLOWSTATE_THREAD_COUNT`: worker pool size (default: 2 x CPU count)
    /// - `FLOWSTATE_POLL_INTERVAL_SECS`: idle poll interval (default: 2)
    /// - `FLOWSTATE_QUEUE_THRESHOLD`: congestion threshold (default: thread count)
    /// - `FLOWSTATE_BUSY_LOOP_LIMIT`: busy-loop ceiling (default: 100)
    /// - `FLOWSTATE_EXECUTOR_TIMEOUT_SECS`: liveness timeout (default: 900)
    /// - `FLOWSTATE_KEEPALIVE_INTERVAL_SECS`: keepalive interval (default: 60)
    /// - `FLOWSTATE_LAG_WARNING_SECS`: execution lag warning (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FLOWSTATE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("FLOWSTATE_DATABASE_URL"))?;

        let defaults = EngineConfig::default();

        let executor_group = match std::env::var("FLOWSTATE_EXECUTOR_GROUP") {
            Ok(group) if group.trim().is_empty() => {
                return Err(ConfigError::Invalid(
                    "FLOWSTATE_EXECUTOR_GROUP",
                    "must not be empty",
                ));
            }
            Ok(group) => group,
            Err(_) => defaults.executor_group,
        };

        let thread_count: usize =
            positive("FLOWSTATE_THREAD_COUNT")?.unwrap_or(defaults.thread_count);
        let queue_threshold: usize = std::env::var("FLOWSTATE_QUEUE_THRESHOLD")
            .ok()
            .map(|raw| raw.parse())
            .transpose()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FLOWSTATE_QUEUE_THRESHOLD",
                    "must be a non-negative integer",
                )
            })?
            .unwrap_or(thread_count);
        let busy_loop_limit: u32 =
            positive("FLOWSTATE_BUSY_LOOP_LIMIT")?.unwrap_or(defaults.busy_loop_limit);

        Ok(Self {
            database_url,
            engine: EngineConfig {
                executor_group,
                thread_count,
                poll_interval: seconds("FLOWSTATE_POLL_INTERVAL_SECS")?
                    .unwrap_or(defaults.poll_interval),
                queue_threshold,
                busy_loop_limit,
                executor_timeout: seconds("FLOWSTATE_EXECUTOR_TIMEOUT_SECS")?
                    .unwrap_or(defaults.executor_timeout),
                keepalive_interval: seconds("FLOWSTATE_KEEPALIVE_INTERVAL_SECS")?
                    .unwrap_or(defaults.keepalive_interval),
                lag_warning: seconds("FLOWSTATE_LAG_WARNING_SECS")?
                    .unwrap_or(defaults.lag_warning),
            },
        })
    }
}

/// Optional integer variable that must be greater than zero.
fn positive<T>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    match std::env::var(var) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) if value > T::default() => Ok(Some(value)),
            _ => Err(ConfigError::Invalid(var, "must be a positive integer")),
        },
        Err(_) => Ok(None),
    }
}

fn seconds(var: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(positive::<u64>(var)
        .map_err(|_| ConfigError::Invalid(var, "must be a positive number of seconds"))?
        .map(Duration::from_secs))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
