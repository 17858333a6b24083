//! Usage metering service
//!
//! Validates and records usage events. Events carrying an explicit
//! `recorded_at` older than the settle watermark may land behind an existing
//! checkpoint, so the affected entries are destroyed after the insert. When
//! that destroy fails the work is queued instead of failing the ingestion.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::AggregationCache;
use crate::error::{BillingError, BillingResult};
use crate::invalidation::{InvalidationCoordinator, StreamInvalidation};
use crate::models::{NewUsageEvent, UsageEvent};
use crate::store::{EventStore, Stores};

/// Usage metering service
#[derive(Clone)]
pub struct UsageMeter {
    events: Arc<dyn EventStore>,
    cache: AggregationCache,
    invalidation: InvalidationCoordinator,
}

impl UsageMeter {
    pub fn new(
        stores: &Stores,
        cache: AggregationCache,
        invalidation: InvalidationCoordinator,
    ) -> Self {
        Self {
            events: stores.events.clone(),
            cache,
            invalidation,
        }
    }

    /// Record a usage event
    pub async fn record_event(&self, event: NewUsageEvent) -> BillingResult<UsageEvent> {
        validate(&event)?;

        let backdated = self.is_backdated(&event);
        let recorded = self.events.insert_event(event).await?;
        debug!(
            organization_id = %recorded.organization_id,
            event_id = %recorded.id,
            code = %recorded.code,
            "Usage event recorded"
        );

        if backdated {
            self.invalidate_behind(&recorded).await?;
        }

        Ok(recorded)
    }

    /// Record a batch of usage events. Every event is validated before any is
    /// stored, and the batch is stored atomically.
    pub async fn record_events(&self, events: Vec<NewUsageEvent>) -> BillingResult<Vec<UsageEvent>> {
        for (index, event) in events.iter().enumerate() {
            validate(event).map_err(|e| match e {
                BillingError::Validation(message) => {
                    BillingError::Validation(format!("event {}: {}", index, message))
                }
                other => other,
            })?;
        }

        let backdated: Vec<bool> = events.iter().map(|e| self.is_backdated(e)).collect();
        let recorded = self.events.insert_events(events).await?;
        debug!(count = recorded.len(), "Usage event batch recorded");

        // One invalidation per stream is enough
        let mut invalidated = HashSet::new();
        for (event, _) in recorded.iter().zip(backdated).filter(|(_, b)| *b) {
            let stream = (
                event.organization_id,
                event.code.clone(),
                event.external_subscription_id.clone(),
            );
            if invalidated.insert(stream) {
                self.invalidate_behind(event).await?;
            }
        }

        Ok(recorded)
    }

    fn is_backdated(&self, event: &NewUsageEvent) -> bool {
        event
            .recorded_at
            .is_some_and(|at| at <= self.cache.watermark())
    }

    async fn invalidate_behind(&self, recorded: &UsageEvent) -> BillingResult<()> {
        if let StreamInvalidation::Destroyed(destroyed) =
            self.invalidation.invalidate_or_defer(recorded).await?
        {
            info!(
                organization_id = %recorded.organization_id,
                event_id = %recorded.id,
                recorded_at = %recorded.recorded_at,
                entries_destroyed = destroyed,
                "Back-dated usage event invalidated checkpoints"
            );
        }
        Ok(())
    }
}

fn validate(event: &NewUsageEvent) -> BillingResult<()> {
    if event.code.trim().is_empty() {
        return Err(BillingError::Validation("event code is required".to_string()));
    }
    if event.external_subscription_id.trim().is_empty() {
        return Err(BillingError::Validation(
            "external_subscription_id is required".to_string(),
        ));
    }
    if !event.properties.is_object() {
        return Err(BillingError::Validation(
            "event properties must be a JSON object".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use rust_decimal::Decimal;
    use time::OffsetDateTime;

    fn event(fx: &Fixture, units: i64) -> NewUsageEvent {
        NewUsageEvent {
            organization_id: fx.org,
            external_subscription_id: "sub_1".to_string(),
            code: fx.metric.code.clone(),
            group_id: None,
            charge_filter_id: None,
            properties: serde_json::json!({ "units": units }),
            recorded_at: None,
        }
    }

    #[tokio::test]
    async fn test_rejects_blank_code_and_non_object_properties() {
        let fx = Fixture::new().await;

        let mut blank = event(&fx, 1);
        blank.code = "  ".to_string();
        assert!(matches!(
            fx.service.usage.record_event(blank).await,
            Err(BillingError::Validation(_))
        ));

        let mut scalar = event(&fx, 1);
        scalar.properties = serde_json::json!(5);
        assert!(matches!(
            fx.service.usage.record_event(scalar).await,
            Err(BillingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_backdated_event_invalidates_checkpoint() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        fx.record("sub_1", 10).await;
        let entry = fx.cache.refresh(&coordinate).await.unwrap();
        assert_eq!(entry.current_aggregation, Decimal::from(10));

        let mut late = event(&fx, 5);
        late.recorded_at = Some(OffsetDateTime::now_utc() - time::Duration::days(3));
        fx.service.usage.record_event(late).await.unwrap();

        assert_eq!(fx.cache.find(&coordinate).await.unwrap(), None);
        let rebuilt = fx.cache.refresh(&coordinate).await.unwrap();
        assert_eq!(rebuilt.current_aggregation, Decimal::from(15));
    }

    #[tokio::test]
    async fn test_failed_invalidation_is_deferred_to_job_queue() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        fx.record("sub_1", 10).await;
        fx.cache.refresh(&coordinate).await.unwrap();

        fx.store.fail_next_cache_delete().await;
        let mut late = event(&fx, 5);
        late.recorded_at = Some(OffsetDateTime::now_utc() - time::Duration::days(3));
        fx.service.usage.record_event(late).await.unwrap();

        // Still stale until the queued job runs
        assert!(fx.cache.find(&coordinate).await.unwrap().is_some());
        let summary = fx.service.jobs.run_due().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(fx.cache.find(&coordinate).await.unwrap(), None);

        let rebuilt = fx.cache.refresh(&coordinate).await.unwrap();
        assert_eq!(rebuilt.current_aggregation, Decimal::from(15));
    }

    #[tokio::test]
    async fn test_invalid_batch_stores_nothing() {
        let fx = Fixture::new().await;
        let mut blank = event(&fx, 2);
        blank.code = String::new();

        let err = fx
            .service
            .usage
            .record_events(vec![event(&fx, 1), blank])
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Validation(ref m) if m.starts_with("event 1:")));
        assert!(fx.store.all_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_backdated_batch_invalidates_stream_once() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        fx.record("sub_1", 10).await;
        fx.cache.refresh(&coordinate).await.unwrap();

        let past = OffsetDateTime::now_utc() - time::Duration::days(2);
        let batch: Vec<_> = [1, 2]
            .into_iter()
            .map(|units| NewUsageEvent {
                recorded_at: Some(past),
                ..event(&fx, units)
            })
            .collect();
        let recorded = fx.service.usage.record_events(batch).await.unwrap();
        assert_eq!(recorded.len(), 2);

        assert_eq!(fx.cache.find(&coordinate).await.unwrap(), None);
        let rebuilt = fx.cache.refresh(&coordinate).await.unwrap();
        assert_eq!(rebuilt.current_aggregation, Decimal::from(13));
    }

    #[tokio::test]
    async fn test_live_event_keeps_checkpoint() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        fx.record("sub_1", 10).await;
        let entry = fx.cache.refresh(&coordinate).await.unwrap();

        fx.service.usage.record_event(event(&fx, 1)).await.unwrap();
        assert_eq!(fx.cache.find(&coordinate).await.unwrap(), Some(entry));
    }
}
