//! Aggregation engine
//!
//! A pure fold from usage events to a decimal aggregate. The same events with
//! the same kind always produce the same value, which is what lets any cache
//! entry be rebuilt from the event log.
//!
//! Incremental kinds (`count`, `sum`, `max`, `latest`) can resume from a prior
//! checkpoint value. `unique_count` cannot be derived from a scalar and is
//! always replayed from the start of the log.

use std::collections::HashSet;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::models::{AggregationCacheEntry, BillableMetric, CacheCoordinate, Charge, UsageEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    Sum,
    Max,
    Latest,
    UniqueCount,
}

impl AggregationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationKind::Count => "count",
            AggregationKind::Sum => "sum",
            AggregationKind::Max => "max",
            AggregationKind::Latest => "latest",
            AggregationKind::UniqueCount => "unique_count",
        }
    }

    /// Whether a checkpoint value is enough to continue the fold
    pub fn is_incremental(&self) -> bool {
        !matches!(self, AggregationKind::UniqueCount)
    }

    /// Whether the kind reads a property of each event
    pub fn requires_field(&self) -> bool {
        !matches!(self, AggregationKind::Count)
    }
}

impl std::fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggregationKind {
    type Err = BillingError;

    /// Accepts both the short names and the `_agg` suffixed names used by
    /// metric configuration
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "count" | "count_agg" => Ok(AggregationKind::Count),
            "sum" | "sum_agg" => Ok(AggregationKind::Sum),
            "max" | "max_agg" => Ok(AggregationKind::Max),
            "latest" | "latest_agg" => Ok(AggregationKind::Latest),
            "unique_count" | "unique_count_agg" => Ok(AggregationKind::UniqueCount),
            other => Err(BillingError::UnsupportedAggregationKind(other.to_string())),
        }
    }
}

/// What to aggregate: the kind plus the event property it reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationSpec {
    pub kind: AggregationKind,
    pub field_name: Option<String>,
}

impl AggregationSpec {
    pub fn new(kind: AggregationKind, field_name: Option<&str>) -> BillingResult<Self> {
        if kind.requires_field() && field_name.map_or(true, |f| f.trim().is_empty()) {
            return Err(BillingError::Validation(format!(
                "aggregation '{}' requires a field_name",
                kind
            )));
        }
        Ok(Self {
            kind,
            field_name: field_name.map(str::to_string),
        })
    }

    pub fn from_metric(metric: &BillableMetric) -> BillingResult<Self> {
        Self::new(metric.aggregation_kind()?, metric.field_name.as_deref())
    }

    fn field<'e>(&self, event: &'e UsageEvent) -> Option<&'e serde_json::Value> {
        self.field_name
            .as_deref()
            .and_then(|name| event.properties.get(name))
    }
}

/// Check that a coordinate only names dimensions its metric and charge define
pub fn validate_coordinate(
    metric: &BillableMetric,
    charge: &Charge,
    coordinate: &CacheCoordinate,
) -> BillingResult<()> {
    if charge.id != coordinate.charge_id {
        return Err(BillingError::Validation(format!(
            "coordinate charge {} does not match charge {}",
            coordinate.charge_id, charge.id
        )));
    }
    if charge.billable_metric_id != metric.id {
        return Err(BillingError::Validation(format!(
            "charge {} is not backed by metric {}",
            charge.id, metric.id
        )));
    }
    if let Some(group_id) = coordinate.group_id {
        if !metric.group_ids.contains(&group_id) {
            return Err(BillingError::EmptyGroupMismatch(format!(
                "metric '{}' has no group {}",
                metric.code, group_id
            )));
        }
    }
    if let Some(filter_id) = coordinate.charge_filter_id {
        if !charge.filter_ids.contains(&filter_id) {
            return Err(BillingError::EmptyGroupMismatch(format!(
                "charge {} has no filter {}",
                charge.id, filter_id
            )));
        }
    }
    Ok(())
}

/// Streaming fold over events
#[derive(Debug, Clone)]
pub struct Aggregator<'s> {
    spec: &'s AggregationSpec,
    total: Decimal,
    extreme: Option<Decimal>,
    unique: HashSet<String>,
    folded: u64,
}

impl<'s> Aggregator<'s> {
    pub fn new(spec: &'s AggregationSpec) -> Self {
        Self {
            spec,
            total: Decimal::ZERO,
            extreme: None,
            unique: HashSet::new(),
            folded: 0,
        }
    }

    /// Continue from a checkpoint value. `None` means the checkpoint is empty.
    pub fn resume(spec: &'s AggregationSpec, prior: Option<Decimal>) -> BillingResult<Self> {
        let mut aggregator = Self::new(spec);
        let Some(prior) = prior else {
            return Ok(aggregator);
        };
        match spec.kind {
            AggregationKind::Count | AggregationKind::Sum => aggregator.total = prior,
            AggregationKind::Max | AggregationKind::Latest => aggregator.extreme = Some(prior),
            AggregationKind::UniqueCount => {
                return Err(BillingError::Validation(
                    "unique_count cannot resume from a checkpoint value".to_string(),
                ))
            }
        }
        Ok(aggregator)
    }

    pub fn push(&mut self, event: &UsageEvent) {
        if event.is_deleted() {
            return;
        }
        self.folded += 1;

        match self.spec.kind {
            AggregationKind::Count => self.total += Decimal::ONE,
            AggregationKind::Sum => {
                if let Some(value) = self.spec.field(event).and_then(numeric_value) {
                    self.total += value;
                }
            }
            AggregationKind::Max => {
                if let Some(value) = self.spec.field(event).and_then(numeric_value) {
                    self.extreme = Some(self.extreme.map_or(value, |current| current.max(value)));
                }
            }
            AggregationKind::Latest => {
                if let Some(value) = self.spec.field(event).and_then(numeric_value) {
                    self.extreme = Some(value);
                }
            }
            AggregationKind::UniqueCount => {
                if let Some(key) = self.spec.field(event).and_then(unique_key) {
                    self.unique.insert(key);
                }
            }
        }
    }

    pub fn extend<'e, I>(&mut self, events: I)
    where
        I: IntoIterator<Item = &'e UsageEvent>,
    {
        for event in events {
            self.push(event);
        }
    }

    /// Number of live events pushed so far
    pub fn folded(&self) -> u64 {
        self.folded
    }

    pub fn finish(self) -> Decimal {
        match self.spec.kind {
            AggregationKind::Count | AggregationKind::Sum => self.total,
            AggregationKind::Max | AggregationKind::Latest => {
                self.extreme.unwrap_or(Decimal::ZERO)
            }
            AggregationKind::UniqueCount => Decimal::from(self.unique.len() as u64),
        }
    }
}

/// Aggregate `events`, optionally continuing from a checkpoint.
///
/// With `since`, only events after the checkpoint's cursor are folded onto its
/// value.
pub fn compute<'e, I>(
    spec: &AggregationSpec,
    events: I,
    since: Option<&AggregationCacheEntry>,
) -> BillingResult<Decimal>
where
    I: IntoIterator<Item = &'e UsageEvent>,
{
    match since {
        None => {
            let mut aggregator = Aggregator::new(spec);
            aggregator.extend(events);
            Ok(aggregator.finish())
        }
        Some(entry) => {
            let cursor = entry.cursor();
            let mut aggregator = Aggregator::resume(spec, checkpoint_value(entry))?;
            aggregator.extend(events.into_iter().filter(|e| cursor.precedes(e)));
            Ok(aggregator.finish())
        }
    }
}

/// The checkpoint value to resume from, or `None` for a never-advanced entry
pub(crate) fn checkpoint_value(entry: &AggregationCacheEntry) -> Option<Decimal> {
    if entry.cursor() == crate::models::EventCursor::origin() {
        None
    } else {
        Some(entry.current_aggregation)
    }
}

fn numeric_value(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => parse_decimal(&n.to_string()),
        serde_json::Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}

fn unique_key(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
