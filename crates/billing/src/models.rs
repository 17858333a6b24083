//! Metering domain model
//!
//! Events, the billable metric registry, the read-only plan/charge/subscription
//! catalog, and the aggregation cache entry (checkpoint) keyed by a
//! [`CacheCoordinate`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::aggregation::AggregationKind;
use crate::error::{BillingError, BillingResult};

/// A raw usage event. Immutable once recorded except for soft deletion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageEvent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    /// Billable metric code this event counts toward
    pub code: String,
    pub group_id: Option<Uuid>,
    pub charge_filter_id: Option<Uuid>,
    pub properties: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    /// When the store accepted the event. Unlike `recorded_at` this is never
    /// client supplied, so it orders ingestion against metric retirement.
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UsageEvent {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Ordering key shared by the engine, the cursor and the stores
    pub fn sort_key(&self) -> (OffsetDateTime, Uuid) {
        (self.recorded_at, self.id)
    }
}

/// Event as submitted for ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUsageEvent {
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    pub code: String,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub charge_filter_id: Option<Uuid>,
    #[serde(default = "empty_properties")]
    pub properties: serde_json::Value,
    /// Explicit timestamp for imports and corrections; the store assigns one otherwise
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
}

fn empty_properties() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Lifecycle of a billable metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Active,
    /// Retirement requested; the invalidation cascade has not finished
    PendingDeletion,
    Deleted,
}

impl MetricStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricStatus::Active => "active",
            MetricStatus::PendingDeletion => "pending_deletion",
            MetricStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MetricStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MetricStatus::Active),
            "pending_deletion" => Ok(MetricStatus::PendingDeletion),
            "deleted" => Ok(MetricStatus::Deleted),
            other => Err(BillingError::Validation(format!(
                "unknown metric status '{}'",
                other
            ))),
        }
    }
}

/// Definition of what counts as a unit of usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillableMetric {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
    /// Raw aggregation type as configured (e.g. `sum`, `unique_count`)
    pub aggregation_type: String,
    /// Event property the aggregation reads, for field-based kinds
    pub field_name: Option<String>,
    /// Groups (dimensions) a cache coordinate may be keyed by
    pub group_ids: Vec<Uuid>,
    pub status: MetricStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub status_changed_at: OffsetDateTime,
}

impl BillableMetric {
    pub fn new(organization_id: Uuid, code: &str, aggregation_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            code: code.to_string(),
            aggregation_type: aggregation_type.to_string(),
            field_name: None,
            group_ids: Vec::new(),
            status: MetricStatus::Active,
            deleted_at: None,
            status_changed_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn with_field(mut self, field_name: &str) -> Self {
        self.field_name = Some(field_name.to_string());
        self
    }

    pub fn with_groups(mut self, group_ids: Vec<Uuid>) -> Self {
        self.group_ids = group_ids;
        self
    }

    /// Parse the configured aggregation type
    pub fn aggregation_kind(&self) -> BillingResult<AggregationKind> {
        self.aggregation_type.parse()
    }

    pub fn is_active(&self) -> bool {
        self.status == MetricStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub code: String,
}

/// A plan's pricing rule for one metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Charge {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub plan_id: Uuid,
    pub billable_metric_id: Uuid,
    /// Filters a cache coordinate may be keyed by
    pub filter_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_id: String,
    pub plan_id: Uuid,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

impl Subscription {
    pub const ACTIVE: &'static str = "active";

    pub fn is_active(&self) -> bool {
        self.status == Self::ACTIVE
    }
}

/// Identity of one aggregation stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheCoordinate {
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    pub charge_id: Uuid,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub charge_filter_id: Option<Uuid>,
}

impl CacheCoordinate {
    pub fn new(organization_id: Uuid, external_subscription_id: &str, charge_id: Uuid) -> Self {
        Self {
            organization_id,
            external_subscription_id: external_subscription_id.to_string(),
            charge_id,
            group_id: None,
            charge_filter_id: None,
        }
    }

    pub fn with_group(mut self, group_id: Uuid) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_filter(mut self, charge_filter_id: Uuid) -> Self {
        self.charge_filter_id = Some(charge_filter_id);
        self
    }

    /// Whether an event belongs to this coordinate's stream.
    ///
    /// An unset group or filter on the coordinate does not restrict events.
    pub fn matches(&self, event: &UsageEvent) -> bool {
        event.organization_id == self.organization_id
            && event.external_subscription_id == self.external_subscription_id
            && self.group_id.map_or(true, |g| event.group_id == Some(g))
            && self
                .charge_filter_id
                .map_or(true, |f| event.charge_filter_id == Some(f))
    }
}

/// Position in the event log a checkpoint was computed up to.
///
/// Events are ordered by `(recorded_at, id)`. Without an `event_id` every event
/// recorded at or before `timestamp` counts as already folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventCursor {
    pub timestamp: OffsetDateTime,
    pub event_id: Option<Uuid>,
}

impl EventCursor {
    /// Cursor of an empty checkpoint
    pub fn origin() -> Self {
        Self {
            timestamp: OffsetDateTime::UNIX_EPOCH,
            event_id: None,
        }
    }

    pub fn after(event: &UsageEvent) -> Self {
        Self {
            timestamp: event.recorded_at,
            event_id: Some(event.id),
        }
    }

    /// True when `event` lies strictly after this cursor
    pub fn precedes(&self, event: &UsageEvent) -> bool {
        match event.recorded_at.cmp(&self.timestamp) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.event_id.is_some_and(|id| event.id > id),
        }
    }
}

/// Last computed aggregate for a coordinate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AggregationCacheEntry {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub external_subscription_id: String,
    pub charge_id: Uuid,
    pub group_id: Option<Uuid>,
    pub charge_filter_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub current_aggregation: Decimal,
    pub grouped_by: Option<serde_json::Value>,
    /// Weak provenance link to the last folded event; never ownership
    pub event_id: Option<Uuid>,
    /// Optimistic concurrency token, bumped on every committed advance
    pub lock_version: i64,
}

impl AggregationCacheEntry {
    /// A zero-valued checkpoint positioned before every event
    pub fn zero(coordinate: &CacheCoordinate) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: coordinate.organization_id,
            external_subscription_id: coordinate.external_subscription_id.clone(),
            charge_id: coordinate.charge_id,
            group_id: coordinate.group_id,
            charge_filter_id: coordinate.charge_filter_id,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            current_aggregation: Decimal::ZERO,
            grouped_by: None,
            event_id: None,
            lock_version: 0,
        }
    }

    pub fn coordinate(&self) -> CacheCoordinate {
        CacheCoordinate {
            organization_id: self.organization_id,
            external_subscription_id: self.external_subscription_id.clone(),
            charge_id: self.charge_id,
            group_id: self.group_id,
            charge_filter_id: self.charge_filter_id,
        }
    }

    pub fn cursor(&self) -> EventCursor {
        EventCursor {
            timestamp: self.timestamp,
            event_id: self.event_id,
        }
    }
}
