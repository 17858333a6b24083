//! In-memory backend
//!
//! Everything lives behind one async mutex, so every trait method is atomic
//! with respect to every other. Used by the test suites and for running the
//! API without a database.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BackfillFlag, CacheInvalidation, CacheStore, CatalogStore, EventDeletion, EventQuery,
    EventStore, JobQueue, LegacyAggregationSource, LineageCandidate, QuantifiedEvent,
};
use crate::error::{BillingError, BillingResult};
use crate::jobs::{DeferredJob, EnqueueOutcome, JobStatus, QueuedJob};
use crate::models::{
    AggregationCacheEntry, BillableMetric, CacheCoordinate, Charge, MetricStatus, NewUsageEvent,
    Plan, Subscription, UsageEvent,
};

fn into_stored(event: NewUsageEvent, now: OffsetDateTime) -> UsageEvent {
    UsageEvent {
        id: Uuid::new_v4(),
        organization_id: event.organization_id,
        external_subscription_id: event.external_subscription_id,
        code: event.code,
        group_id: event.group_id,
        charge_filter_id: event.charge_filter_id,
        properties: event.properties,
        recorded_at: event.recorded_at.unwrap_or(now),
        deleted_at: None,
        created_at: now,
    }
}

/// Uniqueness key of a cache entry
type CoordinateKey = (Uuid, Option<Uuid>, Option<Uuid>, String);

fn coordinate_key(coordinate: &CacheCoordinate) -> CoordinateKey {
    (
        coordinate.charge_id,
        coordinate.group_id,
        coordinate.charge_filter_id,
        coordinate.external_subscription_id.clone(),
    )
}

#[derive(Debug, Clone)]
struct JobRecord {
    id: Uuid,
    job: DeferredJob,
    status: JobStatus,
    attempts: i32,
    last_error: Option<String>,
    run_after: OffsetDateTime,
    locked_at: Option<OffsetDateTime>,
    completed_at: Option<OffsetDateTime>,
}

#[derive(Default)]
struct State {
    metrics: HashMap<Uuid, BillableMetric>,
    plans: HashMap<Uuid, Plan>,
    charges: HashMap<Uuid, Charge>,
    subscriptions: HashMap<Uuid, Subscription>,
    events: Vec<UsageEvent>,
    cache: HashMap<CoordinateKey, AggregationCacheEntry>,
    jobs: HashMap<Uuid, JobRecord>,
    legacy: BTreeMap<Uuid, QuantifiedEvent>,
    flags: HashMap<Uuid, BackfillFlag>,
    fail_next_soft_delete: bool,
    fail_next_cache_delete: bool,
}

impl State {
    /// Mirrors the `FOR SHARE` metric check the Postgres backend performs
    fn ensure_metric_active(&self, metric_id: Uuid) -> BillingResult<()> {
        match self.metrics.get(&metric_id) {
            Some(metric) if metric.is_active() => Ok(()),
            Some(_) => Err(BillingError::MetricRetired(metric_id)),
            None => Err(BillingError::NotFound(format!(
                "billable metric {}",
                metric_id
            ))),
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_metric(&self, metric: BillableMetric) {
        self.state.lock().await.metrics.insert(metric.id, metric);
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.state.lock().await.plans.insert(plan.id, plan);
    }

    pub async fn insert_charge(&self, charge: Charge) {
        self.state.lock().await.charges.insert(charge.id, charge);
    }

    pub async fn insert_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id, subscription);
    }

    pub async fn insert_legacy_record(&self, record: QuantifiedEvent) {
        self.state.lock().await.legacy.insert(record.id, record);
    }

    /// All events, deleted ones included
    pub async fn all_events(&self) -> Vec<UsageEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn flags(&self) -> Vec<BackfillFlag> {
        let mut flags: Vec<_> = self.state.lock().await.flags.values().cloned().collect();
        flags.sort_by_key(|f| f.legacy_record_id);
        flags
    }

    /// Status of every queued job, for assertions
    pub async fn job_statuses(&self) -> Vec<(DeferredJob, JobStatus, i32)> {
        self.state
            .lock()
            .await
            .jobs
            .values()
            .map(|r| (r.job.clone(), r.status, r.attempts))
            .collect()
    }

    /// Make the next bulk soft delete fail with a transient error
    pub async fn fail_next_soft_delete(&self) {
        self.state.lock().await.fail_next_soft_delete = true;
    }

    /// Make the next cache entry deletion fail with a transient error
    pub async fn fail_next_cache_delete(&self) {
        self.state.lock().await.fail_next_cache_delete = true;
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn insert_event(&self, event: NewUsageEvent) -> BillingResult<UsageEvent> {
        let recorded = into_stored(event, OffsetDateTime::now_utc());
        self.state.lock().await.events.push(recorded.clone());
        Ok(recorded)
    }

    async fn insert_events(&self, events: Vec<NewUsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let recorded: Vec<UsageEvent> = events.into_iter().map(|e| into_stored(e, now)).collect();
        state.events.extend(recorded.iter().cloned());
        Ok(recorded)
    }

    async fn find_events(&self, query: &EventQuery) -> BillingResult<Vec<UsageEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<UsageEvent> = state
            .events
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        events.sort_by_key(UsageEvent::sort_key);
        events.truncate(query.limit.max(0) as usize);
        Ok(events)
    }

    async fn find_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<Option<UsageEvent>> {
        Ok(self
            .state
            .lock()
            .await
            .events
            .iter()
            .find(|e| e.id == event_id && e.organization_id == organization_id)
            .cloned())
    }

    async fn soft_delete_events(&self, deletion: &EventDeletion) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_soft_delete) {
            return Err(BillingError::TransientStorage(
                "injected soft delete failure".to_string(),
            ));
        }

        let mut targets: Vec<(OffsetDateTime, Uuid)> = state
            .events
            .iter()
            .filter(|e| {
                e.deleted_at.is_none()
                    && e.organization_id == deletion.organization_id
                    && e.code == deletion.code
                    && e.created_at <= deletion.ingested_until
            })
            .map(UsageEvent::sort_key)
            .collect();
        targets.sort();
        targets.truncate(deletion.batch_size.max(0) as usize);

        let mut deleted = 0;
        for event in state.events.iter_mut() {
            if event.deleted_at.is_none() && targets.binary_search(&event.sort_key()).is_ok() {
                event.deleted_at = Some(deletion.deleted_at);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn soft_delete_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
        deleted_at: OffsetDateTime,
    ) -> BillingResult<Option<UsageEvent>> {
        let mut state = self.state.lock().await;
        let Some(event) = state
            .events
            .iter_mut()
            .find(|e| e.id == event_id && e.organization_id == organization_id)
        else {
            return Ok(None);
        };
        if event.deleted_at.is_some() {
            return Ok(None);
        }
        event.deleted_at = Some(deleted_at);
        Ok(Some(event.clone()))
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn find_metric(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
    ) -> BillingResult<Option<BillableMetric>> {
        Ok(self
            .state
            .lock()
            .await
            .metrics
            .get(&metric_id)
            .filter(|m| m.organization_id == organization_id)
            .cloned())
    }

    async fn find_active_metric_by_code(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> BillingResult<Option<BillableMetric>> {
        Ok(self
            .state
            .lock()
            .await
            .metrics
            .values()
            .find(|m| m.organization_id == organization_id && m.code == code && m.is_active())
            .cloned())
    }

    async fn list_metrics(&self, organization_id: Uuid) -> BillingResult<Vec<BillableMetric>> {
        let mut metrics: Vec<_> = self
            .state
            .lock()
            .await
            .metrics
            .values()
            .filter(|m| m.organization_id == organization_id)
            .cloned()
            .collect();
        metrics.sort_by(|a, b| a.code.cmp(&b.code).then(a.id.cmp(&b.id)));
        Ok(metrics)
    }

    async fn organization_ids(&self) -> BillingResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .state
            .lock()
            .await
            .metrics
            .values()
            .map(|m| m.organization_id)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn find_charge(
        &self,
        organization_id: Uuid,
        charge_id: Uuid,
    ) -> BillingResult<Option<Charge>> {
        Ok(self
            .state
            .lock()
            .await
            .charges
            .get(&charge_id)
            .filter(|c| c.organization_id == organization_id)
            .cloned())
    }

    async fn charges_for_metric(&self, metric_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .state
            .lock()
            .await
            .charges
            .values()
            .filter(|c| c.billable_metric_id == metric_id)
            .map(|c| c.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn lineage_candidates(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
        external_subscription_id: &str,
    ) -> BillingResult<Vec<LineageCandidate>> {
        let state = self.state.lock().await;
        let mut candidates = Vec::new();
        for subscription in state.subscriptions.values().filter(|s| {
            s.organization_id == organization_id
                && s.external_id == external_subscription_id
                && s.is_active()
        }) {
            for charge in state
                .charges
                .values()
                .filter(|c| c.plan_id == subscription.plan_id && c.billable_metric_id == metric_id)
            {
                candidates.push(LineageCandidate {
                    charge_id: charge.id,
                    plan_id: charge.plan_id,
                    subscription_id: subscription.id,
                    subscription_started_at: subscription.started_at,
                });
            }
        }
        candidates.sort_by_key(|c| (c.charge_id, c.subscription_id));
        Ok(candidates)
    }

    async fn transition_metric(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
        from: MetricStatus,
        to: MetricStatus,
        at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(metric) = state
            .metrics
            .get_mut(&metric_id)
            .filter(|m| m.organization_id == organization_id)
        else {
            return Ok(false);
        };
        if metric.status != from {
            return Ok(false);
        }
        metric.status = to;
        metric.status_changed_at = at;
        if to == MetricStatus::PendingDeletion && metric.deleted_at.is_none() {
            metric.deleted_at = Some(at);
        }
        Ok(true)
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn find_entry(
        &self,
        coordinate: &CacheCoordinate,
    ) -> BillingResult<Option<AggregationCacheEntry>> {
        Ok(self
            .state
            .lock()
            .await
            .cache
            .get(&coordinate_key(coordinate))
            .filter(|e| e.organization_id == coordinate.organization_id)
            .cloned())
    }

    async fn insert_if_absent(
        &self,
        metric_id: Uuid,
        entry: &AggregationCacheEntry,
    ) -> BillingResult<AggregationCacheEntry> {
        let mut state = self.state.lock().await;
        state.ensure_metric_active(metric_id)?;
        let stored = state
            .cache
            .entry(coordinate_key(&entry.coordinate()))
            .or_insert_with(|| entry.clone());
        Ok(stored.clone())
    }

    async fn compare_and_swap(
        &self,
        metric_id: Uuid,
        entry: &AggregationCacheEntry,
    ) -> BillingResult<Option<AggregationCacheEntry>> {
        let mut state = self.state.lock().await;
        state.ensure_metric_active(metric_id)?;
        let Some(stored) = state.cache.get_mut(&coordinate_key(&entry.coordinate())) else {
            return Ok(None);
        };
        if stored.id != entry.id || stored.lock_version != entry.lock_version {
            return Ok(None);
        }
        *stored = AggregationCacheEntry {
            lock_version: entry.lock_version + 1,
            ..entry.clone()
        };
        Ok(Some(stored.clone()))
    }

    async fn delete_entries(&self, predicate: &CacheInvalidation) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        if std::mem::take(&mut state.fail_next_cache_delete) {
            return Err(BillingError::TransientStorage(
                "injected cache delete failure".to_string(),
            ));
        }
        let before = state.cache.len();
        state.cache.retain(|_, entry| !predicate.matches(entry));
        Ok((before - state.cache.len()) as u64)
    }

    async fn list_entries(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<AggregationCacheEntry>> {
        let mut entries: Vec<_> = self
            .state
            .lock()
            .await
            .cache
            .values()
            .filter(|e| e.organization_id == organization_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        Ok(entries)
    }
}

#[async_trait]
impl JobQueue for InMemoryStore {
    async fn enqueue(&self, job: &DeferredJob) -> BillingResult<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        let dedupe_key = job.dedupe_key();
        if let Some(existing) = state.jobs.values().find(|r| {
            r.job.dedupe_key() == dedupe_key
                && matches!(r.status, JobStatus::Pending | JobStatus::Running)
        }) {
            return Ok(EnqueueOutcome::AlreadyQueued(existing.id));
        }

        let id = Uuid::new_v4();
        state.jobs.insert(
            id,
            JobRecord {
                id,
                job: job.clone(),
                status: JobStatus::Pending,
                attempts: 0,
                last_error: None,
                run_after: OffsetDateTime::now_utc(),
                locked_at: None,
                completed_at: None,
            },
        );
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn claim_due(
        &self,
        limit: i64,
        stale_after: std::time::Duration,
    ) -> BillingResult<Vec<QueuedJob>> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let stale_before = now - stale_after;

        let mut due: Vec<(OffsetDateTime, Uuid)> = state
            .jobs
            .values()
            .filter(|r| match r.status {
                JobStatus::Pending => r.run_after <= now,
                JobStatus::Running => r.locked_at.is_some_and(|at| at < stale_before),
                JobStatus::Completed | JobStatus::Dead => false,
            })
            .map(|r| (r.run_after, r.id))
            .collect();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(record) = state.jobs.get_mut(&id) {
                record.status = JobStatus::Running;
                record.locked_at = Some(now);
                record.attempts += 1;
                claimed.push(QueuedJob {
                    id: record.id,
                    job: record.job.clone(),
                    attempts: record.attempts,
                });
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: Uuid) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| BillingError::NotFound(format!("job {}", job_id)))?;
        record.status = JobStatus::Completed;
        record.locked_at = None;
        record.completed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| BillingError::NotFound(format!("job {}", job_id)))?;
        record.last_error = Some(error.to_string());
        record.locked_at = None;
        match retry_at {
            Some(at) => {
                record.status = JobStatus::Pending;
                record.run_after = at;
            }
            None => {
                record.status = JobStatus::Dead;
                record.completed_at = Some(OffsetDateTime::now_utc());
            }
        }
        Ok(())
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, r| {
            !(matches!(r.status, JobStatus::Completed | JobStatus::Dead)
                && r.completed_at.is_some_and(|at| at < older_than))
        });
        Ok((before - state.jobs.len()) as u64)
    }
}

#[async_trait]
impl LegacyAggregationSource for InMemoryStore {
    async fn legacy_records(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<QuantifiedEvent>> {
        let state = self.state.lock().await;
        let records = state
            .legacy
            .values()
            .filter(|r| after.map_or(true, |a| r.id > a))
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        Ok(records)
    }

    async fn flag_for_resolution(&self, flag: &BackfillFlag) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .flags
            .insert(flag.legacy_record_id, flag.clone());
        Ok(())
    }
}
