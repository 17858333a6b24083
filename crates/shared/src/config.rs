//! Environment-driven configuration
//!
//! Every binary in the workspace loads `.env` (if present) and then calls
//! [`Config::from_env`]. Only `DATABASE_URL` is required; everything else has
//! a production default.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Application configuration shared by the API server, the worker and the
/// backfill CLI
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Direct (non-pooled) URL used for migrations, if different
    pub database_direct_url: Option<String>,
    pub bind_address: String,
    pub database_max_connections: u32,

    /// Events soft-deleted per statement during a metric retirement
    pub delete_events_batch_size: i64,
    /// Events fetched per page when advancing a checkpoint
    pub cache_page_size: i64,
    /// Events newer than `now - settle_window` are left for the next refresh
    pub cache_settle_window: Duration,
    pub cache_max_conflict_retries: usize,

    pub job_batch_size: i64,
    pub job_max_attempts: i32,
    pub job_stale_after: Duration,
    pub job_retention_days: i64,
    pub job_poll_cron: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            database_direct_url: std::env::var("DATABASE_DIRECT_URL").ok(),
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
            delete_events_batch_size: env_or("DELETE_EVENTS_BATCH_SIZE", 1000)?,
            cache_page_size: env_or("CACHE_PAGE_SIZE", 500)?,
            cache_settle_window: Duration::from_millis(env_or("CACHE_SETTLE_WINDOW_MS", 2000)?),
            cache_max_conflict_retries: env_or("CACHE_MAX_CONFLICT_RETRIES", 5)?,
            job_batch_size: env_or("JOB_BATCH_SIZE", 10)?,
            job_max_attempts: env_or("JOB_MAX_ATTEMPTS", 8)?,
            job_stale_after: Duration::from_secs(env_or("JOB_STALE_AFTER_SECS", 1800)?),
            job_retention_days: env_or("JOB_RETENTION_DAYS", 7)?,
            job_poll_cron: std::env::var("JOB_POLL_CRON")
                .unwrap_or_else(|_| "*/15 * * * * *".to_string()),
        })
    }

    /// URL to run migrations against (bypasses poolers that lack prepared statements)
    pub fn migration_url(&self) -> &str {
        self.database_direct_url
            .as_deref()
            .unwrap_or(&self.database_url)
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_uses_default_when_unset() {
        let value: i64 = env_or("METERLINE_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_env_or_rejects_garbage() {
        std::env::set_var("METERLINE_TEST_GARBAGE_KEY", "not-a-number");
        let result: Result<i64, _> = env_or("METERLINE_TEST_GARBAGE_KEY", 1);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { key: "METERLINE_TEST_GARBAGE_KEY", .. })
        ));
        std::env::remove_var("METERLINE_TEST_GARBAGE_KEY");
    }
}
