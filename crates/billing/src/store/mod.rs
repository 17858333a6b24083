//! Storage boundaries of the metering core
//!
//! Each collaborator the core talks to is an `async_trait` seam with two
//! backends: [`PgStore`] for production and [`InMemoryStore`] for tests and
//! local runs. Both enforce the same guarantees: one cache entry per
//! coordinate, compare-and-swap advances, and no cache writes for a metric
//! that is not `Active`.

mod memory;
mod pg;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::jobs::{DeferredJob, EnqueueOutcome, QueuedJob};
use crate::models::{
    AggregationCacheEntry, BillableMetric, CacheCoordinate, Charge, EventCursor, MetricStatus,
    NewUsageEvent, UsageEvent,
};

pub use memory::InMemoryStore;
pub use pg::PgStore;

/// Page size of an [`EventQuery`] unless overridden with [`EventQuery::limit`]
pub const DEFAULT_EVENT_PAGE_SIZE: i64 = 1000;

/// Range/predicate query over live (non-deleted) events, ordered by
/// `(recorded_at, id)`
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub organization_id: Uuid,
    pub code: Option<String>,
    pub external_subscription_id: Option<String>,
    pub group_id: Option<Uuid>,
    pub charge_filter_id: Option<Uuid>,
    /// Only events strictly after this cursor
    pub after: Option<EventCursor>,
    /// Only events recorded at or before this instant
    pub until: Option<OffsetDateTime>,
    /// Only events ingested at or before this instant
    pub ingested_until: Option<OffsetDateTime>,
    pub limit: i64,
}

impl EventQuery {
    pub fn for_organization(organization_id: Uuid) -> Self {
        Self {
            organization_id,
            code: None,
            external_subscription_id: None,
            group_id: None,
            charge_filter_id: None,
            after: None,
            until: None,
            ingested_until: None,
            limit: DEFAULT_EVENT_PAGE_SIZE,
        }
    }

    /// Events of one coordinate's stream for a metric code
    pub fn for_coordinate(coordinate: &CacheCoordinate, code: &str) -> Self {
        Self {
            organization_id: coordinate.organization_id,
            code: Some(code.to_string()),
            external_subscription_id: Some(coordinate.external_subscription_id.clone()),
            group_id: coordinate.group_id,
            charge_filter_id: coordinate.charge_filter_id,
            after: None,
            until: None,
            ingested_until: None,
            limit: DEFAULT_EVENT_PAGE_SIZE,
        }
    }

    pub fn code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn after(mut self, cursor: Option<EventCursor>) -> Self {
        self.after = cursor;
        self
    }

    pub fn until(mut self, until: Option<OffsetDateTime>) -> Self {
        self.until = until;
        self
    }

    pub fn ingested_until(mut self, ingested_until: Option<OffsetDateTime>) -> Self {
        self.ingested_until = ingested_until;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub(crate) fn matches(&self, event: &UsageEvent) -> bool {
        event.deleted_at.is_none()
            && event.organization_id == self.organization_id
            && self.code.as_deref().map_or(true, |c| event.code == c)
            && self
                .external_subscription_id
                .as_deref()
                .map_or(true, |s| event.external_subscription_id == s)
            && self.group_id.map_or(true, |g| event.group_id == Some(g))
            && self
                .charge_filter_id
                .map_or(true, |f| event.charge_filter_id == Some(f))
            && self.after.map_or(true, |cursor| cursor.precedes(event))
            && self.until.map_or(true, |until| event.recorded_at <= until)
            && self
                .ingested_until
                .map_or(true, |until| event.created_at <= until)
    }
}

/// Predicate for one batch of a bulk soft delete
#[derive(Debug, Clone)]
pub struct EventDeletion {
    pub organization_id: Uuid,
    pub code: String,
    /// Events ingested after this instant are left alone, whatever their
    /// `recorded_at`
    pub ingested_until: OffsetDateTime,
    pub deleted_at: OffsetDateTime,
    pub batch_size: i64,
}

/// Predicate selecting cache entries to destroy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInvalidation {
    pub organization_id: Uuid,
    pub charge_ids: Vec<Uuid>,
    /// Restrict to one subscription; all subscriptions when unset
    pub external_subscription_id: Option<String>,
}

impl CacheInvalidation {
    pub fn charges(organization_id: Uuid, charge_ids: Vec<Uuid>) -> Self {
        Self {
            organization_id,
            charge_ids,
            external_subscription_id: None,
        }
    }

    pub fn for_subscription(mut self, external_subscription_id: &str) -> Self {
        self.external_subscription_id = Some(external_subscription_id.to_string());
        self
    }

    pub(crate) fn matches(&self, entry: &AggregationCacheEntry) -> bool {
        entry.organization_id == self.organization_id
            && self.charge_ids.contains(&entry.charge_id)
            && self
                .external_subscription_id
                .as_deref()
                .map_or(true, |s| entry.external_subscription_id == s)
    }
}

/// One way a legacy record's metric could map to a current charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LineageCandidate {
    pub charge_id: Uuid,
    pub plan_id: Uuid,
    pub subscription_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub subscription_started_at: OffsetDateTime,
}

/// Legacy event-derived aggregation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QuantifiedEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    pub billable_metric_id: Uuid,
    pub group_id: Option<Uuid>,
    pub charge_filter_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub removed_at: Option<OffsetDateTime>,
    pub grouped_by: Option<serde_json::Value>,
    pub properties: serde_json::Value,
}

/// A legacy record set aside for manual resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillFlag {
    pub legacy_record_id: Uuid,
    pub organization_id: Uuid,
    pub reason: String,
    pub candidate_charge_ids: Vec<Uuid>,
}

/// Append-only usage event log
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn insert_event(&self, event: NewUsageEvent) -> BillingResult<UsageEvent>;

    /// Insert every event or none of them
    async fn insert_events(&self, events: Vec<NewUsageEvent>) -> BillingResult<Vec<UsageEvent>>;

    async fn find_events(&self, query: &EventQuery) -> BillingResult<Vec<UsageEvent>>;

    async fn find_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<Option<UsageEvent>>;

    /// Soft-delete up to `batch_size` live events; returns how many were deleted
    async fn soft_delete_events(&self, deletion: &EventDeletion) -> BillingResult<u64>;

    /// Soft-delete one event. Returns the event only if this call deleted it.
    async fn soft_delete_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
        deleted_at: OffsetDateTime,
    ) -> BillingResult<Option<UsageEvent>>;
}

/// Read-only view of metrics, plans, charges and subscriptions, plus the
/// metric status transitions owned by the invalidation cascade
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn find_metric(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
    ) -> BillingResult<Option<BillableMetric>>;

    /// The live (not retired) metric with this code
    async fn find_active_metric_by_code(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> BillingResult<Option<BillableMetric>>;

    async fn list_metrics(&self, organization_id: Uuid) -> BillingResult<Vec<BillableMetric>>;

    async fn organization_ids(&self) -> BillingResult<Vec<Uuid>>;

    async fn find_charge(
        &self,
        organization_id: Uuid,
        charge_id: Uuid,
    ) -> BillingResult<Option<Charge>>;

    async fn charges_for_metric(&self, metric_id: Uuid) -> BillingResult<Vec<Uuid>>;

    /// Charges of `metric_id` on the plan of any active subscription with this
    /// external id
    async fn lineage_candidates(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
        external_subscription_id: &str,
    ) -> BillingResult<Vec<LineageCandidate>>;

    /// Move a metric from `from` to `to`; false when it was not in `from`.
    ///
    /// Entering `PendingDeletion` also stamps `deleted_at`.
    async fn transition_metric(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
        from: MetricStatus,
        to: MetricStatus,
        at: OffsetDateTime,
    ) -> BillingResult<bool>;
}

/// Checkpoint storage
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn find_entry(
        &self,
        coordinate: &CacheCoordinate,
    ) -> BillingResult<Option<AggregationCacheEntry>>;

    /// Persist `entry` unless its coordinate already has one; returns whichever
    /// entry is stored. Fails with `MetricRetired` if `metric_id` is not active.
    async fn insert_if_absent(
        &self,
        metric_id: Uuid,
        entry: &AggregationCacheEntry,
    ) -> BillingResult<AggregationCacheEntry>;

    /// Replace the stored entry if its `lock_version` still equals
    /// `entry.lock_version`. Returns the stored entry (version bumped), or
    /// `None` when the entry changed or was destroyed meanwhile.
    async fn compare_and_swap(
        &self,
        metric_id: Uuid,
        entry: &AggregationCacheEntry,
    ) -> BillingResult<Option<AggregationCacheEntry>>;

    async fn delete_entries(&self, predicate: &CacheInvalidation) -> BillingResult<u64>;

    async fn list_entries(&self, organization_id: Uuid)
        -> BillingResult<Vec<AggregationCacheEntry>>;
}

/// Deferred work queue, executed at least once by the worker
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue unless an identical job is already pending or running
    async fn enqueue(&self, job: &DeferredJob) -> BillingResult<EnqueueOutcome>;

    /// Claim due jobs, including ones stuck in `running` for longer than `stale_after`
    async fn claim_due(
        &self,
        limit: i64,
        stale_after: std::time::Duration,
    ) -> BillingResult<Vec<QueuedJob>>;

    async fn mark_completed(&self, job_id: Uuid) -> BillingResult<()>;

    /// Reschedule at `retry_at`, or mark dead when `None`
    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64>;
}

/// Legacy aggregation records consumed by the backfill
#[async_trait]
pub trait LegacyAggregationSource: Send + Sync {
    /// Next page of records ordered by id
    async fn legacy_records(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<QuantifiedEvent>>;

    async fn flag_for_resolution(&self, flag: &BackfillFlag) -> BillingResult<()>;
}

/// The store handles a service is wired with
#[derive(Clone)]
pub struct Stores {
    pub events: Arc<dyn EventStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub cache: Arc<dyn CacheStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub legacy: Arc<dyn LegacyAggregationSource>,
}

impl Stores {
    /// Wire every seam to one backend
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: EventStore + CatalogStore + CacheStore + JobQueue + LegacyAggregationSource + 'static,
    {
        Self {
            events: backend.clone(),
            catalog: backend.clone(),
            cache: backend.clone(),
            jobs: backend.clone(),
            legacy: backend,
        }
    }
}
