//! Deferred work
//!
//! Jobs are enqueued by the core and executed at least once by the worker.
//! Handlers are idempotent, so a job that is claimed twice (stale lock
//! recovery, crash after the work but before `mark_completed`) is harmless.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::invalidation::InvalidationCoordinator;
use crate::store::{JobQueue, Stores};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeferredJob {
    /// Finish retiring a billable metric
    DeleteMetricEvents {
        organization_id: Uuid,
        metric_id: Uuid,
    },
    /// Destroy the checkpoints a back-dated event landed behind
    InvalidateEventStream {
        organization_id: Uuid,
        code: String,
        external_subscription_id: String,
    },
}

impl DeferredJob {
    pub fn kind(&self) -> &'static str {
        match self {
            DeferredJob::DeleteMetricEvents { .. } => "delete_metric_events",
            DeferredJob::InvalidateEventStream { .. } => "invalidate_event_stream",
        }
    }

    /// Two jobs with the same key are never queued at the same time
    pub fn dedupe_key(&self) -> String {
        match self {
            DeferredJob::DeleteMetricEvents { metric_id, .. } => {
                format!("{}:{}", self.kind(), metric_id)
            }
            DeferredJob::InvalidateEventStream {
                organization_id,
                code,
                external_subscription_id,
            } => format!(
                "{}:{}:{}:{}",
                self.kind(),
                organization_id,
                code,
                external_subscription_id
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued(Uuid),
    /// An identical job was already pending or running
    AlreadyQueued(Uuid),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::AlreadyQueued(id) => *id,
        }
    }
}

/// A claimed job; `attempts` includes the current one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: DeferredJob,
    pub attempts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// Gave up after too many attempts or a permanent error
    Dead,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Dead => "dead",
        }
    }
}

/// Exponential backoff between attempts of a failed job
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempts`-th failed attempt: base, 2x base, 4x base...
    pub fn delay_for(&self, attempts: i32) -> Duration {
        let exponent = attempts.saturating_sub(1).clamp(0, 20) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }

    /// When to run again, or `None` once attempts are exhausted
    pub fn next_run(&self, attempts: i32, now: OffsetDateTime) -> Option<OffsetDateTime> {
        (attempts < self.max_attempts).then(|| now + self.delay_for(attempts))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobRunSummary {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub dead: usize,
}

#[derive(Clone)]
pub struct JobRunner {
    queue: Arc<dyn JobQueue>,
    invalidation: InvalidationCoordinator,
    policy: RetryPolicy,
    batch_size: i64,
    stale_after: Duration,
}

impl JobRunner {
    pub fn new(
        stores: &Stores,
        invalidation: InvalidationCoordinator,
        config: &BillingConfig,
    ) -> Self {
        Self {
            queue: stores.jobs.clone(),
            invalidation,
            policy: RetryPolicy {
                max_attempts: config.job_max_attempts,
                ..RetryPolicy::default()
            },
            batch_size: config.job_batch_size,
            stale_after: config.job_stale_after,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Claim and execute one batch of due jobs
    pub async fn run_due(&self) -> BillingResult<JobRunSummary> {
        let claimed = self
            .queue
            .claim_due(self.batch_size, self.stale_after)
            .await?;
        let mut summary = JobRunSummary {
            claimed: claimed.len(),
            ..JobRunSummary::default()
        };

        for queued in claimed {
            match self.execute(&queued.job).await {
                Ok(()) => {
                    self.queue.mark_completed(queued.id).await?;
                    summary.completed += 1;
                    info!(
                        job_id = %queued.id,
                        kind = queued.job.kind(),
                        attempts = queued.attempts,
                        "Deferred job completed"
                    );
                }
                Err(e) => {
                    let retry_at = if e.is_retryable() {
                        self.policy.next_run(queued.attempts, OffsetDateTime::now_utc())
                    } else {
                        None
                    };
                    self.queue
                        .mark_failed(queued.id, &e.to_string(), retry_at)
                        .await?;

                    match retry_at {
                        Some(at) => {
                            summary.retried += 1;
                            warn!(
                                job_id = %queued.id,
                                kind = queued.job.kind(),
                                attempts = queued.attempts,
                                retry_at = %at,
                                error = %e,
                                "Deferred job failed, will retry"
                            );
                        }
                        None => {
                            summary.dead += 1;
                            error!(
                                job_id = %queued.id,
                                kind = queued.job.kind(),
                                attempts = queued.attempts,
                                error = %e,
                                "Deferred job failed permanently"
                            );
                        }
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Drop completed and dead jobs finished more than `retention` ago
    pub async fn purge_finished(&self, retention: Duration) -> BillingResult<u64> {
        self.queue
            .purge_finished(OffsetDateTime::now_utc() - retention)
            .await
    }

    async fn execute(&self, job: &DeferredJob) -> BillingResult<()> {
        match job {
            DeferredJob::DeleteMetricEvents {
                organization_id,
                metric_id,
            } => {
                self.invalidation
                    .run_retirement(*organization_id, *metric_id)
                    .await?;
                Ok(())
            }
            DeferredJob::InvalidateEventStream {
                organization_id,
                code,
                external_subscription_id,
            } => {
                let destroyed = self
                    .invalidation
                    .invalidate_stream(*organization_id, code, external_subscription_id)
                    .await?;
                debug!(
                    organization_id = %organization_id,
                    code = %code,
                    entries_destroyed = destroyed,
                    "Deferred checkpoint invalidation applied"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_key_ignores_organization() {
        let metric_id = Uuid::new_v4();
        let a = DeferredJob::DeleteMetricEvents {
            organization_id: Uuid::new_v4(),
            metric_id,
        };
        let b = DeferredJob::DeleteMetricEvents {
            organization_id: Uuid::new_v4(),
            metric_id,
        };
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        assert!(a.dedupe_key().starts_with("delete_metric_events:"));
    }

    #[test]
    fn test_stream_invalidation_dedupes_per_subscription() {
        let org = Uuid::new_v4();
        let job = |sub: &str| DeferredJob::InvalidateEventStream {
            organization_id: org,
            code: "api_calls".to_string(),
            external_subscription_id: sub.to_string(),
        };
        assert_eq!(job("sub_1").dedupe_key(), job("sub_1").dedupe_key());
        assert_ne!(job("sub_1").dedupe_key(), job("sub_2").dedupe_key());
        assert!(job("sub_1").dedupe_key().starts_with("invalidate_event_stream:"));
    }

    #[test]
    fn test_job_payload_is_tagged() {
        let job = DeferredJob::DeleteMetricEvents {
            organization_id: Uuid::nil(),
            metric_id: Uuid::nil(),
        };
        let payload = serde_json::to_value(&job).unwrap();
        assert_eq!(payload["kind"], "delete_metric_events");
        assert_eq!(serde_json::from_value::<DeferredJob>(payload).unwrap(), job);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(30));
        assert_eq!(policy.delay_for(2), Duration::from_secs(60));
        assert_eq!(policy.delay_for(4), Duration::from_secs(240));
        assert_eq!(policy.delay_for(30), Duration::from_secs(3600));
    }

    #[test]
    fn test_no_retry_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        };
        let now = OffsetDateTime::now_utc();
        assert!(policy.next_run(2, now).is_some());
        assert!(policy.next_run(3, now).is_none());
    }
}
