//! Postgres backend
//!
//! Cache writes run in a transaction that takes `FOR SHARE` on the owning
//! metric row. The retirement transition updates that row, so a write either
//! commits before the metric leaves `active` or observes the new status and
//! fails with `MetricRetired`.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    BackfillFlag, CacheInvalidation, CacheStore, CatalogStore, EventDeletion, EventQuery,
    EventStore, JobQueue, LegacyAggregationSource, LineageCandidate, QuantifiedEvent,
};
use crate::error::{BillingError, BillingResult};
use crate::jobs::{DeferredJob, EnqueueOutcome, QueuedJob};
use crate::models::{
    AggregationCacheEntry, BillableMetric, CacheCoordinate, Charge, MetricStatus, NewUsageEvent,
    Subscription, UsageEvent,
};

const EVENT_COLUMNS: &str = "id, organization_id, external_subscription_id, code, group_id, \
     charge_filter_id, properties, recorded_at, deleted_at, created_at";

const ENTRY_COLUMNS: &str = "id, organization_id, external_subscription_id, charge_id, group_id, \
     charge_filter_id, \"timestamp\", current_aggregation, grouped_by, event_id, lock_version";

const METRIC_COLUMNS: &str = "id, organization_id, code, aggregation_type, field_name, group_ids, \
     status, deleted_at, status_changed_at";

/// Largest UUID; stands in for "every event at this timestamp" in row comparisons
const MAX_UUID: Uuid = Uuid::from_u128(u128::MAX);

#[derive(sqlx::FromRow)]
struct MetricRow {
    id: Uuid,
    organization_id: Uuid,
    code: String,
    aggregation_type: String,
    field_name: Option<String>,
    group_ids: Vec<Uuid>,
    status: String,
    deleted_at: Option<OffsetDateTime>,
    status_changed_at: OffsetDateTime,
}

impl TryFrom<MetricRow> for BillableMetric {
    type Error = BillingError;

    fn try_from(row: MetricRow) -> Result<Self, Self::Error> {
        Ok(BillableMetric {
            id: row.id,
            organization_id: row.organization_id,
            code: row.code,
            aggregation_type: row.aggregation_type,
            field_name: row.field_name,
            group_ids: row.group_ids,
            status: row.status.parse()?,
            deleted_at: row.deleted_at,
            status_changed_at: row.status_changed_at,
        })
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the metric row against status changes for the rest of `tx`
    async fn lock_active_metric(
        tx: &mut Transaction<'_, Postgres>,
        metric_id: Uuid,
    ) -> BillingResult<()> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM billable_metrics WHERE id = $1 FOR SHARE")
                .bind(metric_id)
                .fetch_optional(&mut **tx)
                .await?;

        match status {
            Some((status,)) if status == MetricStatus::Active.as_str() => Ok(()),
            Some(_) => Err(BillingError::MetricRetired(metric_id)),
            None => Err(BillingError::NotFound(format!(
                "billable metric {}",
                metric_id
            ))),
        }
    }
}

async fn insert_event_row<'e, E>(
    executor: E,
    event: &NewUsageEvent,
    now: OffsetDateTime,
) -> BillingResult<UsageEvent>
where
    E: sqlx::PgExecutor<'e>,
{
    let sql = format!(
        r#"
        INSERT INTO events
            (id, organization_id, external_subscription_id, code, group_id,
             charge_filter_id, properties, recorded_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, $9), $9)
        RETURNING {EVENT_COLUMNS}
        "#
    );
    let recorded = sqlx::query_as::<_, UsageEvent>(&sql)
        .bind(Uuid::new_v4())
        .bind(event.organization_id)
        .bind(&event.external_subscription_id)
        .bind(&event.code)
        .bind(event.group_id)
        .bind(event.charge_filter_id)
        .bind(&event.properties)
        .bind(event.recorded_at)
        .bind(now)
        .fetch_one(executor)
        .await?;
    Ok(recorded)
}

#[async_trait]
impl EventStore for PgStore {
    async fn insert_event(&self, event: NewUsageEvent) -> BillingResult<UsageEvent> {
        insert_event_row(&self.pool, &event, OffsetDateTime::now_utc()).await
    }

    async fn insert_events(&self, events: Vec<NewUsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        let mut tx = self.pool.begin().await?;
        let now = OffsetDateTime::now_utc();
        let mut recorded = Vec::with_capacity(events.len());
        for event in &events {
            recorded.push(insert_event_row(&mut *tx, event, now).await?);
        }
        tx.commit().await?;
        Ok(recorded)
    }

    async fn find_events(&self, query: &EventQuery) -> BillingResult<Vec<UsageEvent>> {
        let sql = format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE organization_id = $1
              AND deleted_at IS NULL
              AND ($2::TEXT IS NULL OR code = $2)
              AND ($3::TEXT IS NULL OR external_subscription_id = $3)
              AND ($4::UUID IS NULL OR group_id = $4)
              AND ($5::UUID IS NULL OR charge_filter_id = $5)
              AND ($6::TIMESTAMPTZ IS NULL OR (recorded_at, id) > ($6, $7::UUID))
              AND ($8::TIMESTAMPTZ IS NULL OR recorded_at <= $8)
              AND ($10::TIMESTAMPTZ IS NULL OR created_at <= $10)
            ORDER BY recorded_at, id
            LIMIT $9
            "#
        );
        let events = sqlx::query_as::<_, UsageEvent>(&sql)
            .bind(query.organization_id)
            .bind(query.code.as_deref())
            .bind(query.external_subscription_id.as_deref())
            .bind(query.group_id)
            .bind(query.charge_filter_id)
            .bind(query.after.map(|c| c.timestamp))
            .bind(
                query
                    .after
                    .map(|c| c.event_id.unwrap_or(MAX_UUID))
                    .unwrap_or(MAX_UUID),
            )
            .bind(query.until)
            .bind(query.limit)
            .bind(query.ingested_until)
            .fetch_all(&self.pool)
            .await?;
        Ok(events)
    }

    async fn find_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
    ) -> BillingResult<Option<UsageEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1 AND organization_id = $2");
        let event = sqlx::query_as::<_, UsageEvent>(&sql)
            .bind(event_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }

    async fn soft_delete_events(&self, deletion: &EventDeletion) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            WITH batch AS (
                SELECT id FROM events
                WHERE organization_id = $1
                  AND code = $2
                  AND deleted_at IS NULL
                  AND created_at <= $3
                ORDER BY recorded_at, id
                LIMIT $5
                FOR UPDATE SKIP LOCKED
            )
            UPDATE events SET deleted_at = $4
            FROM batch
            WHERE events.id = batch.id
            "#,
        )
        .bind(deletion.organization_id)
        .bind(&deletion.code)
        .bind(deletion.ingested_until)
        .bind(deletion.deleted_at)
        .bind(deletion.batch_size)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn soft_delete_event(
        &self,
        organization_id: Uuid,
        event_id: Uuid,
        deleted_at: OffsetDateTime,
    ) -> BillingResult<Option<UsageEvent>> {
        let sql = format!(
            r#"
            UPDATE events SET deleted_at = $3
            WHERE id = $1 AND organization_id = $2 AND deleted_at IS NULL
            RETURNING {EVENT_COLUMNS}
            "#
        );
        let event = sqlx::query_as::<_, UsageEvent>(&sql)
            .bind(event_id)
            .bind(organization_id)
            .bind(deleted_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(event)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn find_metric(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
    ) -> BillingResult<Option<BillableMetric>> {
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM billable_metrics WHERE id = $1 AND organization_id = $2"
        );
        sqlx::query_as::<_, MetricRow>(&sql)
            .bind(metric_id)
            .bind(organization_id)
            .fetch_optional(&self.pool)
            .await?
            .map(BillableMetric::try_from)
            .transpose()
    }

    async fn find_active_metric_by_code(
        &self,
        organization_id: Uuid,
        code: &str,
    ) -> BillingResult<Option<BillableMetric>> {
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM billable_metrics \
             WHERE organization_id = $1 AND code = $2 AND status = 'active'"
        );
        sqlx::query_as::<_, MetricRow>(&sql)
            .bind(organization_id)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?
            .map(BillableMetric::try_from)
            .transpose()
    }

    async fn list_metrics(&self, organization_id: Uuid) -> BillingResult<Vec<BillableMetric>> {
        let sql = format!(
            "SELECT {METRIC_COLUMNS} FROM billable_metrics \
             WHERE organization_id = $1 ORDER BY code, id"
        );
        sqlx::query_as::<_, MetricRow>(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(BillableMetric::try_from)
            .collect()
    }

    async fn organization_ids(&self) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            "SELECT DISTINCT organization_id FROM billable_metrics ORDER BY organization_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_charge(
        &self,
        organization_id: Uuid,
        charge_id: Uuid,
    ) -> BillingResult<Option<Charge>> {
        let charge = sqlx::query_as::<_, Charge>(
            r#"
            SELECT id, organization_id, plan_id, billable_metric_id, filter_ids
            FROM charges
            WHERE id = $1 AND organization_id = $2
            "#,
        )
        .bind(charge_id)
        .bind(organization_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(charge)
    }

    async fn charges_for_metric(&self, metric_id: Uuid) -> BillingResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM charges WHERE billable_metric_id = $1 ORDER BY id")
                .bind(metric_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn lineage_candidates(
        &self,
        organization_id: Uuid,
        metric_id: Uuid,
        external_subscription_id: &str,
    ) -> BillingResult<Vec<LineageCandidate>> {
        let candidates = sqlx::query_as::<_, LineageCandidate>(
            r#"
            SELECT c.id AS charge_id,
                   c.plan_id,
                   s.id AS subscription_id,
                   s.started_at AS subscription_started_at
            FROM subscriptions s
            JOIN charges c ON c.plan_id = s.plan_id
            WHERE s.organization_id = $1
              AND s.external_id = $3
              AND s.status = $4
              AND c.billable_metric_id = $2
            ORDER BY c.id, s.id
            "#,
        )
        .bind(organization_id)
        .bind(metric_id)
        .bind(external_subscription_id)
        .bind(Subscription::ACTIVE)
        .fetch_all(&self.pool)
        .await?;
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
        let result = sqlx::query(
            r#"
            UPDATE billable_metrics
            SET status = $4,
                status_changed_at = $5,
                deleted_at = CASE WHEN $4 = 'pending_deletion'
                                  THEN COALESCE(deleted_at, $5)
                                  ELSE deleted_at END,
                updated_at = NOW()
            WHERE id = $1 AND organization_id = $2 AND status = $3
            "#,
        )
        .bind(metric_id)
        .bind(organization_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl CacheStore for PgStore {
    async fn find_entry(
        &self,
        coordinate: &CacheCoordinate,
    ) -> BillingResult<Option<AggregationCacheEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM cached_aggregations
            WHERE organization_id = $1
              AND charge_id = $2
              AND group_id IS NOT DISTINCT FROM $3
              AND charge_filter_id IS NOT DISTINCT FROM $4
              AND external_subscription_id = $5
            "#
        );
        let entry = sqlx::query_as::<_, AggregationCacheEntry>(&sql)
            .bind(coordinate.organization_id)
            .bind(coordinate.charge_id)
            .bind(coordinate.group_id)
            .bind(coordinate.charge_filter_id)
            .bind(&coordinate.external_subscription_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(entry)
    }

    async fn insert_if_absent(
        &self,
        metric_id: Uuid,
        entry: &AggregationCacheEntry,
    ) -> BillingResult<AggregationCacheEntry> {
        let mut tx = self.pool.begin().await?;
        Self::lock_active_metric(&mut tx, metric_id).await?;

        sqlx::query(
            r#"
            INSERT INTO cached_aggregations
                (id, organization_id, external_subscription_id, charge_id, group_id,
                 charge_filter_id, "timestamp", current_aggregation, grouped_by,
                 event_id, lock_version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (charge_id, group_id, charge_filter_id, external_subscription_id)
            DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.organization_id)
        .bind(&entry.external_subscription_id)
        .bind(entry.charge_id)
        .bind(entry.group_id)
        .bind(entry.charge_filter_id)
        .bind(entry.timestamp)
        .bind(entry.current_aggregation)
        .bind(&entry.grouped_by)
        .bind(entry.event_id)
        .bind(entry.lock_version)
        .execute(&mut *tx)
        .await?;

        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM cached_aggregations
            WHERE charge_id = $1
              AND group_id IS NOT DISTINCT FROM $2
              AND charge_filter_id IS NOT DISTINCT FROM $3
              AND external_subscription_id = $4
            "#
        );
        let stored = sqlx::query_as::<_, AggregationCacheEntry>(&sql)
            .bind(entry.charge_id)
            .bind(entry.group_id)
            .bind(entry.charge_filter_id)
            .bind(&entry.external_subscription_id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn compare_and_swap(
        &self,
        metric_id: Uuid,
        entry: &AggregationCacheEntry,
    ) -> BillingResult<Option<AggregationCacheEntry>> {
        let mut tx = self.pool.begin().await?;
        Self::lock_active_metric(&mut tx, metric_id).await?;

        let sql = format!(
            r#"
            UPDATE cached_aggregations
            SET "timestamp" = $3,
                current_aggregation = $4,
                grouped_by = $5,
                event_id = $6,
                lock_version = lock_version + 1,
                updated_at = NOW()
            WHERE id = $1 AND lock_version = $2
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let stored = sqlx::query_as::<_, AggregationCacheEntry>(&sql)
            .bind(entry.id)
            .bind(entry.lock_version)
            .bind(entry.timestamp)
            .bind(entry.current_aggregation)
            .bind(&entry.grouped_by)
            .bind(entry.event_id)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn delete_entries(&self, predicate: &CacheInvalidation) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM cached_aggregations
            WHERE organization_id = $1
              AND charge_id = ANY($2)
              AND ($3::TEXT IS NULL OR external_subscription_id = $3)
            "#,
        )
        .bind(predicate.organization_id)
        .bind(&predicate.charge_ids)
        .bind(predicate.external_subscription_id.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_entries(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<AggregationCacheEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM cached_aggregations WHERE organization_id = $1 ORDER BY id"
        );
        let entries = sqlx::query_as::<_, AggregationCacheEntry>(&sql)
            .bind(organization_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }
}

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(&self, job: &DeferredJob) -> BillingResult<EnqueueOutcome> {
        let payload = serde_json::to_value(job)?;
        let dedupe_key = job.dedupe_key();

        // A concurrent completion can free the dedupe slot between the two
        // statements, so try the pair twice before giving up.
        for _ in 0..2 {
            let inserted: Option<(Uuid,)> = sqlx::query_as(
                r#"
                INSERT INTO deferred_jobs (id, kind, dedupe_key, payload)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (dedupe_key) WHERE status IN ('pending', 'running')
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.kind())
            .bind(&dedupe_key)
            .bind(&payload)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = inserted {
                return Ok(EnqueueOutcome::Enqueued(id));
            }

            let existing: Option<(Uuid,)> = sqlx::query_as(
                r#"
                SELECT id FROM deferred_jobs
                WHERE dedupe_key = $1 AND status IN ('pending', 'running')
                "#,
            )
            .bind(&dedupe_key)
            .fetch_optional(&self.pool)
            .await?;

            if let Some((id,)) = existing {
                return Ok(EnqueueOutcome::AlreadyQueued(id));
            }
        }

        Err(BillingError::TransientStorage(format!(
            "could not enqueue job {}",
            dedupe_key
        )))
    }

    async fn claim_due(
        &self,
        limit: i64,
        stale_after: std::time::Duration,
    ) -> BillingResult<Vec<QueuedJob>> {
        let rows: Vec<(Uuid, serde_json::Value, i32)> = sqlx::query_as(
            r#"
            WITH due AS (
                SELECT id FROM deferred_jobs
                WHERE (status = 'pending' AND run_after <= NOW())
                   OR (status = 'running'
                       AND locked_at < NOW() - make_interval(secs => $2::FLOAT8))
                ORDER BY run_after
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE deferred_jobs j
            SET status = 'running', locked_at = NOW(), attempts = j.attempts + 1
            FROM due
            WHERE j.id = due.id
            RETURNING j.id, j.payload, j.attempts
            "#,
        )
        .bind(limit)
        .bind(stale_after.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        for (id, payload, attempts) in rows {
            match serde_json::from_value::<DeferredJob>(payload) {
                Ok(job) => claimed.push(QueuedJob { id, job, attempts }),
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Undecodable job payload, marking dead");
                    self.mark_failed(id, &format!("undecodable payload: {}", e), None)
                        .await?;
                }
            }
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, job_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE deferred_jobs
            SET status = 'completed', locked_at = NULL, completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        error: &str,
        retry_at: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE deferred_jobs
            SET status = CASE WHEN $3::TIMESTAMPTZ IS NULL THEN 'dead' ELSE 'pending' END,
                run_after = COALESCE($3, run_after),
                completed_at = CASE WHEN $3::TIMESTAMPTZ IS NULL THEN NOW() ELSE NULL END,
                last_error = $2,
                locked_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM deferred_jobs
            WHERE status IN ('completed', 'dead') AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl LegacyAggregationSource for PgStore {
    async fn legacy_records(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> BillingResult<Vec<QuantifiedEvent>> {
        let records = sqlx::query_as::<_, QuantifiedEvent>(
            r#"
            SELECT id, organization_id, external_subscription_id, billable_metric_id,
                   group_id, charge_filter_id, added_at, removed_at, grouped_by, properties
            FROM quantified_events
            WHERE ($1::UUID IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn flag_for_resolution(&self, flag: &BackfillFlag) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO backfill_flags (legacy_record_id, organization_id, reason, candidate_charge_ids)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (legacy_record_id) DO UPDATE SET
                reason = EXCLUDED.reason,
                candidate_charge_ids = EXCLUDED.candidate_charge_ids,
                flagged_at = NOW(),
                resolved_at = NULL
            "#,
        )
        .bind(flag.legacy_record_id)
        .bind(flag.organization_id)
        .bind(&flag.reason)
        .bind(&flag.candidate_charge_ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
