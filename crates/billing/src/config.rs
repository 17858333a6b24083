//! Tuning knobs of the metering core

use std::time::Duration;

use meterline_shared::Config;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Events soft-deleted per statement during a retirement
    pub delete_events_batch_size: i64,
    /// Events folded per page during a refresh
    pub cache_page_size: i64,
    /// Events younger than this are left for the next refresh
    pub settle_window: Duration,
    pub max_conflict_retries: usize,
    pub job_batch_size: i64,
    pub job_max_attempts: i32,
    pub job_stale_after: Duration,
    /// Retirements pending longer than this are reported by the invariant checker
    pub stalled_retirement_after: Duration,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            delete_events_batch_size: 1000,
            cache_page_size: 500,
            settle_window: Duration::from_secs(2),
            max_conflict_retries: 5,
            job_batch_size: 10,
            job_max_attempts: 8,
            job_stale_after: Duration::from_secs(30 * 60),
            stalled_retirement_after: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl From<&Config> for BillingConfig {
    fn from(config: &Config) -> Self {
        Self {
            delete_events_batch_size: config.delete_events_batch_size.max(1),
            cache_page_size: config.cache_page_size.max(1),
            settle_window: config.cache_settle_window,
            max_conflict_retries: config.cache_max_conflict_retries,
            job_batch_size: config.job_batch_size.max(1),
            job_max_attempts: config.job_max_attempts.max(1),
            job_stale_after: config.job_stale_after,
            ..Self::default()
        }
    }
}
