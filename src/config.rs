//! Runtime configuration.

use crate::error::{CoreError, Result};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_MAX_RETRY_COUNT: &str = "OBSERVATORY_MAX_RETRY_COUNT";
pub const ENV_BACKOFF_DELAY_SECONDS: &str = "OBSERVATORY_BACKOFF_DELAY_SECONDS";
pub const ENV_MAILBOX_CAPACITY: &str = "OBSERVATORY_MAILBOX_CAPACITY";
pub const ENV_DEFAULT_PARTITION_COUNT: &str = "OBSERVATORY_DEFAULT_PARTITION_COUNT";
pub const ENV_FILTER_CACHE_SIZE: &str = "OBSERVATORY_FILTER_CACHE_SIZE";
pub const ENV_EVENT_BUFFER_SIZE: &str = "OBSERVATORY_EVENT_BUFFER_SIZE";

/// Observer core configuration.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    /// Attempts made for every remote call before giving up.
    /// Default: 20
    pub max_retry_count: u32,

    /// Fixed delay between attempts.
    /// Default: 1s
    pub backoff_delay: Duration,

    /// Max queued messages per mailbox recipient.
    /// Default: 1000
    pub mailbox_capacity: usize,

    /// Number of registry and mailbox partitions.
    /// Default: 3
    pub default_partition_count: u32,

    /// Compiled filters kept per endpoint.
    /// Default: 256
    pub filter_cache_size: usize,

    /// Buffered events per local event subscriber before it is dropped.
    /// Default: 1000
    pub event_buffer_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 20,
            backoff_delay: Duration::from_secs(1),
            mailbox_capacity: 1000,
            default_partition_count: 3,
            filter_cache_size: 256,
            event_buffer_size: 1000,
        }
    }
}

impl CoreConfig {
    /// Defaults overlaid with `OBSERVATORY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32, _>(&lookup, ENV_MAX_RETRY_COUNT)? {
            config.max_retry_count = v;
        }
        if let Some(secs) = parse_var::<f64, _>(&lookup, ENV_BACKOFF_DELAY_SECONDS)? {
            if !secs.is_finite() || secs < 0.0 {
                return Err(CoreError::Validation(format!(
                    "{} must be a non-negative number of seconds",
                    ENV_BACKOFF_DELAY_SECONDS
                )));
            }
            config.backoff_delay = Duration::from_secs_f64(secs);
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, ENV_MAILBOX_CAPACITY)? {
            config.mailbox_capacity = v;
        }
        if let Some(v) = parse_var::<u32, _>(&lookup, ENV_DEFAULT_PARTITION_COUNT)? {
            config.default_partition_count = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, ENV_FILTER_CACHE_SIZE)? {
            config.filter_cache_size = v;
        }
        if let Some(v) = parse_var::<usize, _>(&lookup, ENV_EVENT_BUFFER_SIZE)? {
            config.event_buffer_size = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the core cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.default_partition_count == 0 {
            return Err(CoreError::Validation("partition count must be at least 1".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(CoreError::Validation("mailbox capacity must be at least 1".into()));
        }
        Ok(())
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| CoreError::Validation(format!("{}={:?}: {}", name, raw, e))),
    }
}
