//! Invalidation coordinator
//!
//! Owns the metric retirement cascade (`Active -> PendingDeletion -> Deleted`)
//! and explicit single-event corrections. Both destroy the affected cache
//! entries outright; the next refresh rebuilds them from the event log.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::AggregationCache;
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::jobs::{DeferredJob, EnqueueOutcome};
use crate::models::{BillableMetric, MetricStatus, UsageEvent};
use crate::store::{CacheInvalidation, CatalogStore, EventDeletion, EventStore, JobQueue, Stores};

/// Result of a retirement request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetirementTicket {
    pub metric_id: Uuid,
    pub status: MetricStatus,
    /// `None` when the metric was already fully deleted
    pub job: Option<EnqueueOutcome>,
}

/// What one run of the cascade did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetirementReport {
    pub metric_id: Uuid,
    pub events_deleted: u64,
    pub entries_destroyed: u64,
    /// The metric was already `Deleted` before this run
    pub already_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoidReport {
    pub event_id: Uuid,
    /// False when the event had already been voided
    pub voided: bool,
    pub entries_destroyed: u64,
}

/// Outcome of invalidating the stream a back-dated event landed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInvalidation {
    Destroyed(u64),
    /// Left to a queued job
    Deferred(EnqueueOutcome),
}

#[derive(Clone)]
pub struct InvalidationCoordinator {
    events: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogStore>,
    jobs: Arc<dyn JobQueue>,
    cache: AggregationCache,
    batch_size: i64,
}

impl InvalidationCoordinator {
    pub fn new(stores: &Stores, cache: AggregationCache, config: &BillingConfig) -> Self {
        Self {
            events: stores.events.clone(),
            catalog: stores.catalog.clone(),
            jobs: stores.jobs.clone(),
            cache,
            batch_size: config.delete_events_batch_size.max(1),
        }
    }

    /// Start retiring a metric.
    ///
    /// Moves it to `PendingDeletion` and queues the cascade. Asking again while
    /// pending re-queues (deduplicated); asking for a deleted metric does nothing.
    pub async fn request_retirement(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
    ) -> BillingResult<RetirementTicket> {
        let metric = self.require_metric(organization_id, metric_id).await?;

        if metric.status == MetricStatus::Active {
            let moved = self
                .catalog
                .transition_metric(
                    organization_id,
                    metric_id,
                    MetricStatus::Active,
                    MetricStatus::PendingDeletion,
                    OffsetDateTime::now_utc(),
                )
                .await?;
            if moved {
                info!(
                    organization_id = %organization_id,
                    metric_id = %metric_id,
                    code = %metric.code,
                    "Billable metric retirement requested"
                );
            }
        }

        // Re-read: a concurrent request or cascade may have moved it on
        let metric = self.require_metric(organization_id, metric_id).await?;
        if metric.status == MetricStatus::Deleted {
            return Ok(RetirementTicket {
                metric_id,
                status: metric.status,
                job: None,
            });
        }

        let job = self
            .jobs
            .enqueue(&DeferredJob::DeleteMetricEvents {
                organization_id,
                metric_id,
            })
            .await?;

        Ok(RetirementTicket {
            metric_id,
            status: metric.status,
            job: Some(job),
        })
    }

    /// Run the cascade for a metric in `PendingDeletion` (or re-run it for a
    /// `Deleted` one, which is a no-op).
    ///
    /// Any storage failure surfaces as `InvalidationIncomplete`; the metric
    /// stays pending and the whole run may be repeated.
    pub async fn run_retirement(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
    ) -> BillingResult<RetirementReport> {
        let metric = self.require_metric(organization_id, metric_id).await?;
        if metric.status == MetricStatus::Active {
            return Err(BillingError::Validation(format!(
                "billable metric {} is active; retirement was not requested",
                metric_id
            )));
        }

        match self.cascade(&metric).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(
                    organization_id = %organization_id,
                    metric_id = %metric_id,
                    error = %e,
                    "Retirement cascade interrupted"
                );
                Err(BillingError::InvalidationIncomplete {
                    metric_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Void one event and destroy the checkpoints that may have folded it in.
    ///
    /// Safe to repeat: a second call finds the event already voided and still
    /// destroys the (possibly rebuilt) entries.
    pub async fn void_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<VoidReport> {
        let now = OffsetDateTime::now_utc();
        let (event, voided) = match self
            .events
            .soft_delete_event(organization_id, event_id, now)
            .await?
        {
            Some(event) => (event, true),
            None => {
                let event = self
                    .events
                    .find_event(organization_id, event_id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("event {}", event_id)))?;
                (event, false)
            }
        };

        let entries_destroyed = self.invalidate_event_stream(&event).await?;
        if voided {
            info!(
                organization_id = %organization_id,
                event_id = %event_id,
                code = %event.code,
                entries_destroyed,
                "Usage event voided"
            );
        }

        Ok(VoidReport {
            event_id,
            voided,
            entries_destroyed,
        })
    }

    /// Destroy the entries of `event`'s subscription for every charge of a
    /// metric with the event's code
    pub(crate) async fn invalidate_event_stream(&self, event: &UsageEvent) -> BillingResult<u64> {
        self.invalidate_stream(
            event.organization_id,
            &event.code,
            &event.external_subscription_id,
        )
        .await
    }

    /// Destroy one subscription's entries for every charge of a metric with `code`
    pub async fn invalidate_stream(
        &self,
        organization_id: Uuid,
        code: &str,
        external_subscription_id: &str,
    ) -> BillingResult<u64> {
        let mut charge_ids = Vec::new();
        for metric in self
            .catalog
            .list_metrics(organization_id)
            .await?
            .into_iter()
            .filter(|m| m.code == code)
        {
            charge_ids.extend(self.catalog.charges_for_metric(metric.id).await?);
        }

        self.cache
            .invalidate(
                &CacheInvalidation::charges(organization_id, charge_ids)
                    .for_subscription(external_subscription_id),
            )
            .await
    }

    /// Invalidate the stream a back-dated event landed in, handing the work to
    /// the job queue when the destroy fails. The event is already persisted, so
    /// only a failed enqueue is returned to the caller.
    pub(crate) async fn invalidate_or_defer(
        &self,
        event: &UsageEvent,
    ) -> BillingResult<StreamInvalidation> {
        match self.invalidate_event_stream(event).await {
            Ok(destroyed) => Ok(StreamInvalidation::Destroyed(destroyed)),
            Err(e) => {
                let job = self
                    .jobs
                    .enqueue(&DeferredJob::InvalidateEventStream {
                        organization_id: event.organization_id,
                        code: event.code.clone(),
                        external_subscription_id: event.external_subscription_id.clone(),
                    })
                    .await?;
                warn!(
                    organization_id = %event.organization_id,
                    event_id = %event.id,
                    code = %event.code,
                    job_id = %job.job_id(),
                    error = %e,
                    "Checkpoint invalidation failed, deferred to job queue"
                );
                Ok(StreamInvalidation::Deferred(job))
            }
        }
    }

    async fn cascade(&self, metric: &BillableMetric) -> BillingResult<RetirementReport> {
        let mut report = RetirementReport {
            metric_id: metric.id,
            already_deleted: metric.status == MetricStatus::Deleted,
            ..RetirementReport::default()
        };

        // Events ingested after retirement belong to whatever reuses the code
        let ingested_until = metric.deleted_at.unwrap_or(metric.status_changed_at);
        let deletion = EventDeletion {
            organization_id: metric.organization_id,
            code: metric.code.clone(),
            ingested_until,
            deleted_at: OffsetDateTime::now_utc(),
            batch_size: self.batch_size,
        };
        loop {
            let deleted = self.events.soft_delete_events(&deletion).await?;
            report.events_deleted += deleted;
            if deleted == 0 {
                break;
            }
        }

        let charge_ids = self.catalog.charges_for_metric(metric.id).await?;
        report.entries_destroyed = self
            .cache
            .invalidate(&CacheInvalidation::charges(
                metric.organization_id,
                charge_ids,
            ))
            .await?;

        if metric.status == MetricStatus::PendingDeletion {
            self.catalog
                .transition_metric(
                    metric.organization_id,
                    metric.id,
                    MetricStatus::PendingDeletion,
                    MetricStatus::Deleted,
                    OffsetDateTime::now_utc(),
                )
                .await?;
        }

        info!(
            organization_id = %metric.organization_id,
            metric_id = %metric.id,
            code = %metric.code,
            events_deleted = report.events_deleted,
            entries_destroyed = report.entries_destroyed,
            already_deleted = report.already_deleted,
            "Billable metric retirement completed"
        );
        Ok(report)
    }

    async fn require_metric(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
    ) -> BillingResult<BillableMetric> {
        self.catalog
            .find_metric(organization_id, metric_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("billable metric {}", metric_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_request_retirement_moves_to_pending_and_enqueues_once() {
        let fx = Fixture::new().await;

        let first = fx
            .service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        let second = fx
            .service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        assert_eq!(first.status, MetricStatus::PendingDeletion);
        assert!(matches!(first.job, Some(EnqueueOutcome::Enqueued(_))));
        assert!(matches!(second.job, Some(EnqueueOutcome::AlreadyQueued(_))));
        assert_eq!(
            first.job.map(|j| j.job_id()),
            second.job.map(|j| j.job_id())
        );
        assert_eq!(fx.store.job_statuses().await.len(), 1);
    }

    #[tokio::test]
    async fn test_run_retirement_rejects_active_metric() {
        let fx = Fixture::new().await;
        let err = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(_)));
    }

    #[tokio::test]
    async fn test_failed_cascade_keeps_metric_pending() {
        let fx = Fixture::new().await;
        fx.record("sub_1", 1).await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();

        fx.store.fail_next_soft_delete().await;
        let err = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidationIncomplete { .. }));
        assert!(err.is_retryable());
        assert_eq!(fx.metric_status().await, MetricStatus::PendingDeletion);

        let report = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        assert_eq!(report.events_deleted, 1);
        assert_eq!(fx.metric_status().await, MetricStatus::Deleted);
    }

    fn event_at(fx: &Fixture, recorded_at: OffsetDateTime) -> crate::models::NewUsageEvent {
        crate::models::NewUsageEvent {
            organization_id: fx.org,
            external_subscription_id: "sub_1".to_string(),
            code: fx.metric.code.clone(),
            group_id: None,
            charge_filter_id: None,
            properties: serde_json::json!({ "units": 9 }),
            recorded_at: Some(recorded_at),
        }
    }

    #[tokio::test]
    async fn test_retirement_spares_events_ingested_after_it() {
        let fx = Fixture::new().await;
        fx.record("sub_1", 1).await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // A replacement metric reuses the code before the cascade runs,
        // back-dated to before the retirement request
        let late = fx
            .store
            .insert_event(event_at(&fx, OffsetDateTime::now_utc() - time::Duration::hours(1)))
            .await
            .unwrap();

        let report = fx
            .service
            .invalidation
            .run_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        assert_eq!(report.events_deleted, 1);

        let stored = fx.store.find_event(fx.org, late.id).await.unwrap().unwrap();
        assert!(!stored.is_deleted());
    }

    #[tokio::test]
    async fn test_retirement_deletes_future_stamped_events_ingested_before_it() {
        let fx = Fixture::new().await;
        fx.record("sub_1", 1).await;
        fx.service
            .usage
            .record_event(event_at(&fx, OffsetDateTime::now_utc() + time::Duration::hours(1)))
            .await
            .unwrap();

        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        fx.service.jobs.run_due().await.unwrap();

        assert_eq!(fx.metric_status().await, MetricStatus::Deleted);
        let live = fx
            .store
            .find_events(&crate::store::EventQuery::for_organization(fx.org))
            .await
            .unwrap();
        assert!(live.is_empty());

        let violations = fx
            .service
            .invariant_checker()
            .run_check(fx.org, "no_live_events_for_deleted_metrics")
            .await
            .unwrap();
        assert!(violations.is_empty());
    }

    #[tokio::test]
    async fn test_void_event_destroys_subscription_entries_only() {
        let fx = Fixture::new().await;
        let e1 = fx.record("sub_1", 4).await;
        fx.record("sub_1", 6).await;
        fx.record("sub_2", 1).await;

        let c1 = fx.coordinate("sub_1");
        let c2 = fx.coordinate("sub_2");
        fx.cache.refresh(&c1).await.unwrap();
        fx.cache.refresh(&c2).await.unwrap();

        let report = fx.service.invalidation.void_event(fx.org, e1.id).await.unwrap();
        assert!(report.voided);
        assert_eq!(report.entries_destroyed, 1);
        assert_eq!(fx.cache.find(&c1).await.unwrap(), None);
        assert!(fx.cache.find(&c2).await.unwrap().is_some());

        let rebuilt = fx.cache.refresh(&c1).await.unwrap();
        assert_eq!(rebuilt.current_aggregation, Decimal::from(6));

        let again = fx.service.invalidation.void_event(fx.org, e1.id).await.unwrap();
        assert!(!again.voided);
    }

    #[tokio::test]
    async fn test_void_unknown_event_is_not_found() {
        let fx = Fixture::new().await;
        let err = fx
            .service
            .invalidation
            .void_event(fx.org, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }
}
