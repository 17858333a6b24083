//! Seeded in-memory world shared by the unit tests

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use time::macros::datetime;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::AggregationCache;
use crate::config::BillingConfig;
use crate::models::{
    BillableMetric, CacheCoordinate, Charge, MetricStatus, NewUsageEvent, Plan, Subscription,
    UsageEvent,
};
use crate::store::{CatalogStore, EventStore, InMemoryStore};
use crate::BillingService;

/// One organization with a `storage` metric summing `units`, a `starter` plan
/// charging it, and subscriptions `sub_1` and `sub_2` on that plan
pub(crate) struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub service: BillingService,
    pub cache: AggregationCache,
    pub org: Uuid,
    pub metric: BillableMetric,
    pub plan: Plan,
    pub charge: Charge,
    pub subscription: Subscription,
    clock: AtomicI64,
    base: OffsetDateTime,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::build(test_config(), "sum", Some("units")).await
    }

    pub async fn with_config(config: BillingConfig) -> Self {
        Self::build(config, "sum", Some("units")).await
    }

    pub async fn with_metric(aggregation_type: &str, field_name: Option<&str>) -> Self {
        Self::build(test_config(), aggregation_type, field_name).await
    }

    async fn build(config: BillingConfig, aggregation_type: &str, field_name: Option<&str>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let org = Uuid::new_v4();

        let mut metric = BillableMetric::new(org, "storage", aggregation_type);
        metric.field_name = field_name.map(str::to_string);
        let plan = Plan {
            id: Uuid::new_v4(),
            organization_id: org,
            code: "starter".to_string(),
        };
        let charge = Charge {
            id: Uuid::new_v4(),
            organization_id: org,
            plan_id: plan.id,
            billable_metric_id: metric.id,
            filter_ids: Vec::new(),
        };
        let subscription = Subscription {
            id: Uuid::new_v4(),
            organization_id: org,
            external_id: "sub_1".to_string(),
            plan_id: plan.id,
            status: "active".to_string(),
            started_at: datetime!(2024-01-01 00:00 UTC),
        };

        store.insert_metric(metric.clone()).await;
        store.insert_plan(plan.clone()).await;
        store.insert_charge(charge.clone()).await;
        store.insert_subscription(subscription.clone()).await;
        store
            .insert_subscription(Subscription {
                id: Uuid::new_v4(),
                external_id: "sub_2".to_string(),
                ..subscription.clone()
            })
            .await;

        let service = BillingService::in_memory(store.clone(), config);
        let cache = service.cache.clone();

        Self {
            store,
            service,
            cache,
            org,
            metric,
            plan,
            charge,
            subscription,
            clock: AtomicI64::new(0),
            base: OffsetDateTime::now_utc() - time::Duration::seconds(60),
        }
    }

    pub fn coordinate(&self, external_subscription_id: &str) -> CacheCoordinate {
        CacheCoordinate::new(self.org, external_subscription_id, self.charge.id)
    }

    /// Insert an event straight into the store, one millisecond after the previous one
    pub async fn record(&self, external_subscription_id: &str, units: i64) -> UsageEvent {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst);
        self.store
            .insert_event(NewUsageEvent {
                organization_id: self.org,
                external_subscription_id: external_subscription_id.to_string(),
                code: self.metric.code.clone(),
                group_id: None,
                charge_filter_id: None,
                properties: serde_json::json!({ "units": units }),
                recorded_at: Some(self.base + time::Duration::milliseconds(tick)),
            })
            .await
            .unwrap()
    }

    pub async fn metric_status(&self) -> MetricStatus {
        self.store
            .find_metric(self.org, self.metric.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

fn test_config() -> BillingConfig {
    BillingConfig {
        settle_window: Duration::ZERO,
        ..BillingConfig::default()
    }
}
