//! Cache invariants
//!
//! Runnable consistency checks for the metering core. Checks only read, so the
//! worker can run them on a schedule against live data.
//!
//! ## Checks
//!
//! 1. **cache_matches_events**: every entry equals the replay of the events up
//!    to its cursor
//! 2. **no_entries_for_retired_metrics**: retirement destroyed every entry
//! 3. **no_live_events_for_deleted_metrics**: retirement soft-deleted every event
//! 4. **no_stalled_retirements**: no metric sits in `pending_deletion` for long

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::AggregationCache;
use crate::config::BillingConfig;
use crate::error::BillingResult;
use crate::models::MetricStatus;
use crate::store::{CacheStore, CatalogStore, EventQuery, EventStore, Stores};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    pub organization_id: Uuid,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Bills computed from the cache would be wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
    /// Informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks for one organization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub organization_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct CacheInvariantChecker {
    events: Arc<dyn EventStore>,
    catalog: Arc<dyn CatalogStore>,
    entries: Arc<dyn CacheStore>,
    cache: AggregationCache,
    stalled_after: Duration,
}

impl CacheInvariantChecker {
    pub fn new(stores: &Stores, cache: AggregationCache, config: &BillingConfig) -> Self {
        Self {
            events: stores.events.clone(),
            catalog: stores.catalog.clone(),
            entries: stores.cache.clone(),
            cache,
            stalled_after: config.stalled_retirement_after,
        }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(self.run_check(organization_id, name).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            organization_id,
            checked_at: now,
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Run a single invariant check by name
    pub async fn run_check(
        &self,
        organization_id: Uuid,
        name: &str,
    ) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "cache_matches_events" => self.check_cache_matches_events(organization_id).await,
            "no_entries_for_retired_metrics" => {
                self.check_no_entries_for_retired_metrics(organization_id)
                    .await
            }
            "no_live_events_for_deleted_metrics" => {
                self.check_no_live_events_for_deleted_metrics(organization_id)
                    .await
            }
            "no_stalled_retirements" => self.check_no_stalled_retirements(organization_id).await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "cache_matches_events",
            "no_entries_for_retired_metrics",
            "no_live_events_for_deleted_metrics",
            "no_stalled_retirements",
        ]
    }

    /// Invariant 1: an entry holds exactly the replay of the events up to its cursor
    async fn check_cache_matches_events(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();

        for entry in self.entries.list_entries(organization_id).await? {
            let coordinate = entry.coordinate();
            let expected = match self.cache.rebuild_to_cursor(&coordinate, entry.cursor()).await {
                Ok(value) => value,
                Err(e) => {
                    violations.push(InvariantViolation {
                        invariant: "cache_matches_events".to_string(),
                        organization_id,
                        description: format!("Cache entry {} cannot be rebuilt: {}", entry.id, e),
                        context: serde_json::json!({
                            "entry_id": entry.id,
                            "charge_id": entry.charge_id,
                        }),
                        severity: ViolationSeverity::Critical,
                    });
                    continue;
                }
            };

            if expected != entry.current_aggregation {
                violations.push(InvariantViolation {
                    invariant: "cache_matches_events".to_string(),
                    organization_id,
                    description: format!(
                        "Cache entry {} holds {} but events up to its cursor aggregate to {}",
                        entry.id, entry.current_aggregation, expected
                    ),
                    context: serde_json::json!({
                        "entry_id": entry.id,
                        "charge_id": entry.charge_id,
                        "external_subscription_id": entry.external_subscription_id,
                        "cached": entry.current_aggregation.to_string(),
                        "expected": expected.to_string(),
                    }),
                    severity: ViolationSeverity::Critical,
                });
            }
        }

        Ok(violations)
    }

    /// Invariant 2: a metric that left `active` has no cache entries once its
    /// cascade completed
    async fn check_no_entries_for_retired_metrics(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let entries = self.entries.list_entries(organization_id).await?;
        let mut violations = Vec::new();

        for metric in self
            .catalog
            .list_metrics(organization_id)
            .await?
            .into_iter()
            .filter(|m| m.status == MetricStatus::Deleted)
        {
            let charges = self.catalog.charges_for_metric(metric.id).await?;
            let stale: Vec<Uuid> = entries
                .iter()
                .filter(|e| charges.contains(&e.charge_id))
                .map(|e| e.id)
                .collect();
            if stale.is_empty() {
                continue;
            }
            violations.push(InvariantViolation {
                invariant: "no_entries_for_retired_metrics".to_string(),
                organization_id,
                description: format!(
                    "Deleted metric '{}' still has {} cache entries",
                    metric.code,
                    stale.len()
                ),
                context: serde_json::json!({
                    "metric_id": metric.id,
                    "entry_ids": stale,
                }),
                severity: ViolationSeverity::Critical,
            });
        }

        Ok(violations)
    }

    /// Invariant 3: no live event was ingested before its deleted metric was
    /// retired
    async fn check_no_live_events_for_deleted_metrics(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let mut violations = Vec::new();

        for metric in self
            .catalog
            .list_metrics(organization_id)
            .await?
            .into_iter()
            .filter(|m| m.status == MetricStatus::Deleted)
        {
            let query = EventQuery::for_organization(organization_id)
                .code(&metric.code)
                .ingested_until(metric.deleted_at)
                .limit(1);
            let live = self.events.find_events(&query).await?;
            if let Some(event) = live.first() {
                violations.push(InvariantViolation {
                    invariant: "no_live_events_for_deleted_metrics".to_string(),
                    organization_id,
                    description: format!(
                        "Deleted metric '{}' still has live events",
                        metric.code
                    ),
                    context: serde_json::json!({
                        "metric_id": metric.id,
                        "example_event_id": event.id,
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }

        Ok(violations)
    }

    /// Invariant 4: retirements finish within the configured window
    async fn check_no_stalled_retirements(
        &self,
        organization_id: Uuid,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let cutoff = OffsetDateTime::now_utc() - self.stalled_after;

        Ok(self
            .catalog
            .list_metrics(organization_id)
            .await?
            .into_iter()
            .filter(|m| m.status == MetricStatus::PendingDeletion && m.status_changed_at < cutoff)
            .map(|metric| InvariantViolation {
                invariant: "no_stalled_retirements".to_string(),
                organization_id,
                description: format!(
                    "Metric '{}' has been pending deletion since {}",
                    metric.code, metric.status_changed_at
                ),
                context: serde_json::json!({
                    "metric_id": metric.id,
                    "pending_since": metric.status_changed_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillableMetric, NewUsageEvent};
    use crate::test_support::Fixture;
    use rust_decimal::Decimal;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = CacheInvariantChecker::available_checks();
        assert_eq!(checks.len(), 4);
        assert!(checks.contains(&"cache_matches_events"));
        assert!(checks.contains(&"no_stalled_retirements"));
    }

    #[tokio::test]
    async fn test_healthy_after_refresh_and_retirement() {
        let fx = Fixture::new().await;
        fx.record("sub_1", 2).await;
        fx.cache.refresh(&fx.coordinate("sub_1")).await.unwrap();

        let checker = fx.service.invariant_checker();
        assert!(checker.run_all_checks(fx.org).await.unwrap().healthy);

        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        fx.service.jobs.run_due().await.unwrap();

        let summary = checker.run_all_checks(fx.org).await.unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
        assert_eq!(summary.checks_run, 4);
    }

    #[tokio::test]
    async fn test_detects_drifted_entry() {
        let fx = Fixture::new().await;
        let coordinate = fx.coordinate("sub_1");
        fx.record("sub_1", 2).await;
        let entry = fx.cache.refresh(&coordinate).await.unwrap();

        // Simulate a bad write
        let mut drifted = entry.clone();
        drifted.current_aggregation = Decimal::from(99);
        fx.store.compare_and_swap(fx.metric.id, &drifted).await.unwrap();

        let violations = fx
            .service
            .invariant_checker()
            .run_check(fx.org, "cache_matches_events")
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);
    }

    #[tokio::test]
    async fn test_reports_pending_retirement_as_stalled() {
        let fx = Fixture::with_config(BillingConfig {
            settle_window: Duration::ZERO,
            stalled_retirement_after: Duration::ZERO,
            ..BillingConfig::default()
        })
        .await;
        fx.service
            .invalidation
            .request_retirement(fx.org, fx.metric.id)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let violations = fx
            .service
            .invariant_checker()
            .run_check(fx.org, "no_stalled_retirements")
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
    }

    #[tokio::test]
    async fn test_detects_live_event_left_behind_by_retirement() {
        let fx = Fixture::new().await;

        // Ingested before retirement but stamped an hour ahead
        fx.store
            .insert_event(NewUsageEvent {
                organization_id: fx.org,
                external_subscription_id: "sub_1".to_string(),
                code: "legacy_calls".to_string(),
                group_id: None,
                charge_filter_id: None,
                properties: serde_json::json!({}),
                recorded_at: Some(OffsetDateTime::now_utc() + time::Duration::hours(1)),
            })
            .await
            .unwrap();
        let mut retired = BillableMetric::new(fx.org, "legacy_calls", "count");
        retired.status = MetricStatus::Deleted;
        retired.deleted_at = Some(OffsetDateTime::now_utc());
        fx.store.insert_metric(retired.clone()).await;

        let violations = fx
            .service
            .invariant_checker()
            .run_check(fx.org, "no_live_events_for_deleted_metrics")
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].context["metric_id"], retired.id.to_string());
    }
}
