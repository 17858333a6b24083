//! Backfill migrator
//!
//! One-shot conversion of legacy quantified-event records into aggregation
//! cache entries. Each record's metric is resolved to exactly one current
//! charge through the subscription's plan; records that cannot be resolved
//! are flagged for an operator, never guessed.
//!
//! Reruns are safe: coordinates that already have an entry are counted and
//! left untouched.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{AggregationCacheEntry, CacheCoordinate};
use crate::store::{
    BackfillFlag, CacheStore, CatalogStore, LegacyAggregationSource, LineageCandidate,
    QuantifiedEvent, Stores,
};

/// Property holding a legacy record's aggregate
pub const AGGREGATE_PROPERTY: &str = "total_aggregated_units";

/// Why a legacy record could not be mapped to a single charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineageIssue {
    /// The record carries no usable aggregate value
    MissingAggregate,
    NoMatchingCharge,
    MultipleCharges(Vec<Uuid>),
    /// The operator override names a charge that does not back the record's metric
    InvalidOverride(Uuid),
}

impl LineageIssue {
    pub fn reason(&self) -> &'static str {
        match self {
            LineageIssue::MissingAggregate => "missing_aggregate",
            LineageIssue::NoMatchingCharge => "no_matching_charge",
            LineageIssue::MultipleCharges(_) => "multiple_charges",
            LineageIssue::InvalidOverride(_) => "invalid_override",
        }
    }

    pub fn candidate_charge_ids(&self) -> Vec<Uuid> {
        match self {
            LineageIssue::MultipleCharges(ids) => ids.clone(),
            LineageIssue::InvalidOverride(id) => vec![*id],
            LineageIssue::MissingAggregate | LineageIssue::NoMatchingCharge => Vec::new(),
        }
    }
}

impl std::fmt::Display for LineageIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LineageIssue::MissingAggregate => {
                write!(f, "record has no {} value", AGGREGATE_PROPERTY)
            }
            LineageIssue::NoMatchingCharge => write!(f, "no charge matches the record's metric"),
            LineageIssue::MultipleCharges(ids) => {
                write!(f, "{} charges match the record's metric", ids.len())
            }
            LineageIssue::InvalidOverride(id) => {
                write!(f, "override charge {} does not back the record's metric", id)
            }
        }
    }
}

/// How to choose among several candidate charges
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineagePolicy {
    /// Exactly one distinct candidate charge, otherwise flag
    #[default]
    Strict,
    /// Prefer the charge reached through the most recently started
    /// subscription; a tie is still ambiguous
    MostRecentSubscription,
}

impl FromStr for LineagePolicy {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().replace('-', "_").as_str() {
            "strict" => Ok(LineagePolicy::Strict),
            "most_recent_subscription" => Ok(LineagePolicy::MostRecentSubscription),
            other => Err(BillingError::Validation(format!(
                "unknown lineage policy '{}'",
                other
            ))),
        }
    }
}

/// What to do with a flagged record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityAction {
    #[default]
    Skip,
    Halt,
}

impl FromStr for AmbiguityAction {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "skip" => Ok(AmbiguityAction::Skip),
            "halt" => Ok(AmbiguityAction::Halt),
            other => Err(BillingError::Validation(format!(
                "unknown ambiguity action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackfillOptions {
    pub policy: LineagePolicy,
    pub on_ambiguity: AmbiguityAction,
    /// Operator resolutions: legacy record id -> charge id
    pub overrides: HashMap<Uuid, Uuid>,
    pub batch_size: i64,
    /// Resolve and report without writing entries or flags
    pub dry_run: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            policy: LineagePolicy::default(),
            on_ambiguity: AmbiguityAction::default(),
            overrides: HashMap::new(),
            batch_size: 500,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: u64,
    pub created: u64,
    /// Coordinates that already had an entry (earlier run or live traffic)
    pub already_present: u64,
    /// Would have been created; dry runs only
    pub planned: u64,
    /// Records already removed in the legacy table
    pub skipped_removed: u64,
    /// Records whose metric is no longer active
    pub skipped_retired: u64,
    pub flagged: Vec<Uuid>,
}

enum Outcome {
    Created,
    AlreadyPresent,
    Planned,
    Retired,
}

pub struct BackfillMigrator {
    catalog: Arc<dyn CatalogStore>,
    cache: Arc<dyn CacheStore>,
    legacy: Arc<dyn LegacyAggregationSource>,
    options: BackfillOptions,
}

impl BackfillMigrator {
    pub fn new(stores: &Stores, options: BackfillOptions) -> Self {
        Self {
            catalog: stores.catalog.clone(),
            cache: stores.cache.clone(),
            legacy: stores.legacy.clone(),
            options,
        }
    }

    /// Convert every legacy record.
    ///
    /// With [`AmbiguityAction::Halt`] the run stops at the first flagged record
    /// and returns its `LineageAmbiguity` error; entries written before it stay.
    pub async fn run(&self) -> BillingResult<BackfillReport> {
        let mut report = BackfillReport::default();
        let mut after: Option<Uuid> = None;
        let batch_size = self.options.batch_size.max(1);

        loop {
            let page = self.legacy.legacy_records(after, batch_size).await?;
            let full = page.len() as i64 >= batch_size;

            for record in &page {
                report.scanned += 1;
                after = Some(record.id);

                if record.removed_at.is_some() {
                    report.skipped_removed += 1;
                    continue;
                }

                match self.migrate(record).await {
                    Ok(Outcome::Created) => report.created += 1,
                    Ok(Outcome::AlreadyPresent) => report.already_present += 1,
                    Ok(Outcome::Planned) => report.planned += 1,
                    Ok(Outcome::Retired) => report.skipped_retired += 1,
                    Err(BillingError::LineageAmbiguity { record_id, issue }) => {
                        self.flag(record, &issue).await?;
                        report.flagged.push(record_id);
                        if self.options.on_ambiguity == AmbiguityAction::Halt {
                            warn!(
                                record_id = %record_id,
                                scanned = report.scanned,
                                created = report.created,
                                "Backfill halted on ambiguous lineage"
                            );
                            return Err(BillingError::LineageAmbiguity { record_id, issue });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            if !full {
                break;
            }
        }

        info!(
            scanned = report.scanned,
            created = report.created,
            already_present = report.already_present,
            planned = report.planned,
            flagged = report.flagged.len(),
            dry_run = self.options.dry_run,
            "Backfill completed"
        );
        Ok(report)
    }

    /// Map a legacy record to the single charge it aggregates for
    pub async fn resolve_lineage(&self, record: &QuantifiedEvent) -> BillingResult<Uuid> {
        let ambiguity = |issue| BillingError::LineageAmbiguity {
            record_id: record.id,
            issue,
        };

        if let Some(&charge_id) = self.options.overrides.get(&record.id) {
            let backs_metric = self
                .catalog
                .find_charge(record.organization_id, charge_id)
                .await?
                .is_some_and(|c| c.billable_metric_id == record.billable_metric_id);
            return if backs_metric {
                Ok(charge_id)
            } else {
                Err(ambiguity(LineageIssue::InvalidOverride(charge_id)))
            };
        }

        let candidates = self
            .catalog
            .lineage_candidates(
                record.organization_id,
                record.billable_metric_id,
                &record.external_subscription_id,
            )
            .await?;

        let charges = distinct_charges(&candidates);
        match charges.as_slice() {
            [] => Err(ambiguity(LineageIssue::NoMatchingCharge)),
            [only] => Ok(*only),
            _ => match self.options.policy {
                LineagePolicy::Strict => Err(ambiguity(LineageIssue::MultipleCharges(charges))),
                LineagePolicy::MostRecentSubscription => {
                    let newest = most_recent(&candidates);
                    match newest.as_slice() {
                        [only] => Ok(*only),
                        _ => Err(ambiguity(LineageIssue::MultipleCharges(charges))),
                    }
                }
            },
        }
    }

    async fn migrate(&self, record: &QuantifiedEvent) -> BillingResult<Outcome> {
        let value = aggregate_value(record).ok_or(BillingError::LineageAmbiguity {
            record_id: record.id,
            issue: LineageIssue::MissingAggregate,
        })?;
        let charge_id = self.resolve_lineage(record).await?;

        let coordinate = CacheCoordinate {
            organization_id: record.organization_id,
            external_subscription_id: record.external_subscription_id.clone(),
            charge_id,
            group_id: record.group_id,
            charge_filter_id: record.charge_filter_id,
        };
        if self.cache.find_entry(&coordinate).await?.is_some() {
            return Ok(Outcome::AlreadyPresent);
        }
        if self.options.dry_run {
            return Ok(Outcome::Planned);
        }

        // The legacy value covers every event up to `added_at`
        let entry = AggregationCacheEntry {
            timestamp: record.added_at,
            current_aggregation: value,
            grouped_by: record.grouped_by.clone(),
            ..AggregationCacheEntry::zero(&coordinate)
        };
        match self
            .cache
            .insert_if_absent(record.billable_metric_id, &entry)
            .await
        {
            Ok(stored) if stored.id == entry.id => Ok(Outcome::Created),
            Ok(_) => Ok(Outcome::AlreadyPresent),
            Err(BillingError::MetricRetired(_)) => Ok(Outcome::Retired),
            Err(e) => Err(e),
        }
    }

    async fn flag(&self, record: &QuantifiedEvent, issue: &LineageIssue) -> BillingResult<()> {
        warn!(
            record_id = %record.id,
            organization_id = %record.organization_id,
            metric_id = %record.billable_metric_id,
            external_subscription_id = %record.external_subscription_id,
            issue = %issue,
            "Legacy record flagged for manual resolution"
        );
        if self.options.dry_run {
            return Ok(());
        }
        self.legacy
            .flag_for_resolution(&BackfillFlag {
                legacy_record_id: record.id,
                organization_id: record.organization_id,
                reason: issue.reason().to_string(),
                candidate_charge_ids: issue.candidate_charge_ids(),
            })
            .await
    }
}

fn distinct_charges(candidates: &[LineageCandidate]) -> Vec<Uuid> {
    candidates
        .iter()
        .map(|c| c.charge_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Distinct charges reached through the most recently started subscription(s)
fn most_recent(candidates: &[LineageCandidate]) -> Vec<Uuid> {
    let Some(newest) = candidates.iter().map(|c| c.subscription_started_at).max() else {
        return Vec::new();
    };
    candidates
        .iter()
        .filter(|c| c.subscription_started_at == newest)
        .map(|c| c.charge_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn aggregate_value(record: &QuantifiedEvent) -> Option<Decimal> {
    match record.properties.get(AGGREGATE_PROPERTY)? {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string())
            .or_else(|_| Decimal::from_scientific(&n.to_string()))
            .ok(),
        serde_json::Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}
