//! Aggregation cache
//!
//! One checkpoint per [`CacheCoordinate`]. Entries are created with
//! insert-if-absent, moved forward only by compare-and-swap on
//! `lock_version`, and destroyed (never patched) by invalidation. Any entry can
//! be rebuilt from the non-deleted events up to its cursor.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, info};

use crate::aggregation::{checkpoint_value, validate_coordinate, AggregationSpec, Aggregator};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    AggregationCacheEntry, BillableMetric, CacheCoordinate, Charge, EventCursor, UsageEvent,
};
use crate::store::{CacheInvalidation, CacheStore, CatalogStore, EventQuery, EventStore, Stores};

/// A coordinate with its charge, metric and aggregation looked up
#[derive(Debug, Clone)]
pub(crate) struct ResolvedCoordinate {
    pub coordinate: CacheCoordinate,
    pub metric: BillableMetric,
    pub charge: Charge,
    pub spec: AggregationSpec,
}

#[derive(Clone)]
pub struct AggregationCache {
    events: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogStore>,
    cache: Arc<dyn CacheStore>,
    page_size: i64,
    settle_window: Duration,
    max_conflict_retries: usize,
}

impl AggregationCache {
    pub fn new(stores: &Stores, config: &BillingConfig) -> Self {
        Self {
            events: stores.events.clone(),
            catalog: stores.catalog.clone(),
            cache: stores.cache.clone(),
            page_size: config.cache_page_size.max(1),
            settle_window: config.settle_window,
            max_conflict_retries: config.max_conflict_retries,
        }
    }

    /// Read the stored entry without creating one
    pub async fn find(
        &self,
        coordinate: &CacheCoordinate,
    ) -> BillingResult<Option<AggregationCacheEntry>> {
        self.cache.find_entry(coordinate).await
    }

    /// The entry for `coordinate`, inserting a zero checkpoint if there is none.
    ///
    /// Concurrent callers all receive the single stored entry.
    pub async fn get_or_create(
        &self,
        coordinate: &CacheCoordinate,
    ) -> BillingResult<AggregationCacheEntry> {
        let resolved = self.resolve(coordinate, true).await?;
        self.get_or_create_resolved(&resolved).await
    }

    /// Fold `new_events` onto `entry` and persist with compare-and-swap.
    ///
    /// `new_events` must be the events that immediately follow the entry's
    /// cursor; events at or before the cursor, deleted events and events of
    /// other coordinates are ignored. Fails with `CacheConflict` if the stored
    /// entry moved or was destroyed since `entry` was read.
    pub async fn advance(
        &self,
        entry: &AggregationCacheEntry,
        new_events: &[UsageEvent],
    ) -> BillingResult<AggregationCacheEntry> {
        let resolved = self.resolve(&entry.coordinate(), true).await?;
        self.advance_resolved(&resolved, entry, new_events).await
    }

    /// Bring a coordinate's checkpoint up to the settle watermark.
    ///
    /// Conflicting concurrent advances are retried with jittered exponential
    /// backoff.
    pub async fn refresh(
        &self,
        coordinate: &CacheCoordinate,
    ) -> BillingResult<AggregationCacheEntry> {
        let resolved = self.resolve(coordinate, true).await?;
        let watermark = self.watermark();

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(10)
            .max_delay(Duration::from_secs(1))
            .map(jitter)
            .take(self.max_conflict_retries);

        RetryIf::spawn(
            strategy,
            || self.refresh_once(&resolved, watermark),
            |e: &BillingError| {
                let conflict = matches!(e, BillingError::CacheConflict(_));
                if conflict {
                    debug!(
                        charge_id = %resolved.coordinate.charge_id,
                        external_subscription_id = %resolved.coordinate.external_subscription_id,
                        "Cache advance conflicted, retrying"
                    );
                }
                conflict
            },
        )
        .await
    }

    /// The value the cache must hold for `coordinate`: every non-deleted event
    /// replayed from zero. Reads only; works for retired metrics too.
    pub async fn rebuild_from_scratch(&self, coordinate: &CacheCoordinate) -> BillingResult<Decimal> {
        let resolved = self.resolve(coordinate, false).await?;
        let (value, _) = self.replay(&resolved, None).await?;
        Ok(value)
    }

    /// Replay of the events up to and including `cursor`
    pub(crate) async fn rebuild_to_cursor(
        &self,
        coordinate: &CacheCoordinate,
        cursor: EventCursor,
    ) -> BillingResult<Decimal> {
        let resolved = self.resolve(coordinate, false).await?;
        let (value, _) = self.replay(&resolved, Some(cursor)).await?;
        Ok(value)
    }

    /// Destroy every entry selected by `predicate`
    pub(crate) async fn invalidate(&self, predicate: &CacheInvalidation) -> BillingResult<u64> {
        if predicate.charge_ids.is_empty() {
            return Ok(0);
        }
        let destroyed = self.cache.delete_entries(predicate).await?;
        if destroyed > 0 {
            info!(
                organization_id = %predicate.organization_id,
                charges = predicate.charge_ids.len(),
                external_subscription_id = ?predicate.external_subscription_id,
                destroyed,
                "Destroyed cache entries"
            );
        }
        Ok(destroyed)
    }

    /// Instant before which events count as settled
    pub(crate) fn watermark(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() - self.settle_window
    }

    pub(crate) async fn resolve(
        &self,
        coordinate: &CacheCoordinate,
        require_active: bool,
    ) -> BillingResult<ResolvedCoordinate> {
        let charge = self
            .catalog
            .find_charge(coordinate.organization_id, coordinate.charge_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("charge {}", coordinate.charge_id)))?;

        let metric = self
            .catalog
            .find_metric(coordinate.organization_id, charge.billable_metric_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("billable metric {}", charge.billable_metric_id))
            })?;

        if require_active && !metric.is_active() {
            return Err(BillingError::MetricRetired(metric.id));
        }

        validate_coordinate(&metric, &charge, coordinate)?;
        let spec = AggregationSpec::from_metric(&metric)?;

        Ok(ResolvedCoordinate {
            coordinate: coordinate.clone(),
            metric,
            charge,
            spec,
        })
    }

    async fn get_or_create_resolved(
        &self,
        resolved: &ResolvedCoordinate,
    ) -> BillingResult<AggregationCacheEntry> {
        if let Some(entry) = self.cache.find_entry(&resolved.coordinate).await? {
            return Ok(entry);
        }
        let entry = self
            .cache
            .insert_if_absent(
                resolved.metric.id,
                &AggregationCacheEntry::zero(&resolved.coordinate),
            )
            .await?;
        debug!(
            entry_id = %entry.id,
            charge_id = %entry.charge_id,
            external_subscription_id = %entry.external_subscription_id,
            "Cache entry ready"
        );
        Ok(entry)
    }

    async fn refresh_once(
        &self,
        resolved: &ResolvedCoordinate,
        watermark: OffsetDateTime,
    ) -> BillingResult<AggregationCacheEntry> {
        let mut entry = self.get_or_create_resolved(resolved).await?;

        if !resolved.spec.kind.is_incremental() {
            // Replay once up to the watermark instead of once per page
            let bound = EventCursor {
                timestamp: watermark,
                event_id: None,
            };
            let (value, last) = self.replay(resolved, Some(bound)).await?;
            let Some(last) = last else {
                return Ok(entry);
            };
            if entry.cursor() == EventCursor::after(&last) && entry.current_aggregation == value {
                return Ok(entry);
            }
            return self.commit(resolved, &entry, value, &last).await;
        }

        loop {
            let query = EventQuery::for_coordinate(&resolved.coordinate, &resolved.metric.code)
                .after(Some(entry.cursor()))
                .until(Some(watermark))
                .limit(self.page_size);
            let page = self.events.find_events(&query).await?;
            if page.is_empty() {
                return Ok(entry);
            }
            let full = page.len() as i64 >= self.page_size;
            entry = self.advance_resolved(resolved, &entry, &page).await?;
            if !full {
                return Ok(entry);
            }
        }
    }

    async fn advance_resolved(
        &self,
        resolved: &ResolvedCoordinate,
        entry: &AggregationCacheEntry,
        new_events: &[UsageEvent],
    ) -> BillingResult<AggregationCacheEntry> {
        let cursor = entry.cursor();
        let mut fresh: Vec<&UsageEvent> = new_events
            .iter()
            .filter(|e| {
                !e.is_deleted()
                    && e.code == resolved.metric.code
                    && resolved.coordinate.matches(e)
                    && cursor.precedes(e)
            })
            .collect();
        fresh.sort_by_key(|e| e.sort_key());

        let Some(last) = fresh.last().copied() else {
            return Ok(entry.clone());
        };

        let value = if resolved.spec.kind.is_incremental() {
            let mut aggregator = Aggregator::resume(&resolved.spec, checkpoint_value(entry))?;
            aggregator.extend(fresh.iter().copied());
            aggregator.finish()
        } else {
            let (value, _) = self
                .replay(resolved, Some(EventCursor::after(last)))
                .await?;
            value
        };

        self.commit(resolved, entry, value, last).await
    }

    async fn commit(
        &self,
        resolved: &ResolvedCoordinate,
        entry: &AggregationCacheEntry,
        value: Decimal,
        last: &UsageEvent,
    ) -> BillingResult<AggregationCacheEntry> {
        let next = AggregationCacheEntry {
            timestamp: last.recorded_at,
            event_id: Some(last.id),
            current_aggregation: value,
            ..entry.clone()
        };

        match self
            .cache
            .compare_and_swap(resolved.metric.id, &next)
            .await?
        {
            Some(stored) => {
                debug!(
                    entry_id = %stored.id,
                    value = %stored.current_aggregation,
                    lock_version = stored.lock_version,
                    "Advanced cache entry"
                );
                Ok(stored)
            }
            None => Err(BillingError::CacheConflict(entry.id)),
        }
    }

    /// Fold every non-deleted event of the coordinate up to `bound` (inclusive)
    /// from zero. Returns the value and the last folded event.
    async fn replay(
        &self,
        resolved: &ResolvedCoordinate,
        bound: Option<EventCursor>,
    ) -> BillingResult<(Decimal, Option<UsageEvent>)> {
        let mut aggregator = Aggregator::new(&resolved.spec);
        let mut after: Option<EventCursor> = None;
        let mut last: Option<UsageEvent> = None;

        loop {
            let query = EventQuery::for_coordinate(&resolved.coordinate, &resolved.metric.code)
                .after(after)
                .until(bound.map(|b| b.timestamp))
                .limit(self.page_size);
            let page = self.events.find_events(&query).await?;
            let full = page.len() as i64 >= self.page_size;

            for event in page {
                let beyond = bound.is_some_and(|b| {
                    event.recorded_at == b.timestamp && b.event_id.is_some_and(|id| event.id > id)
                });
                if beyond {
                    return Ok((aggregator.finish(), last));
                }
                aggregator.push(&event);
                after = Some(EventCursor::after(&event));
                last = Some(event);
            }

            if !full {
                return Ok((aggregator.finish(), last));
            }
        }
    }
}
