//! Deferred job draining and periodic maintenance
//!
//! Each function runs one cycle and logs its outcome; failures are logged and
//! left for the next tick rather than propagated to the scheduler.

use std::time::Duration;

use meterline_billing::store::CatalogStore;
use meterline_billing::{BillingService, JobRunSummary, ViolationSeverity};
use tracing::{debug, error, info, warn};

/// Upper bound on batches drained per tick so one tick cannot starve the next
const MAX_BATCHES_PER_TICK: usize = 20;

/// Claim and execute due jobs until the queue is drained or the per-tick
/// bound is hit
pub async fn process_job_queue(billing: &BillingService) {
    let mut total = JobRunSummary::default();

    for _ in 0..MAX_BATCHES_PER_TICK {
        match billing.jobs.run_due().await {
            Ok(summary) => {
                total.claimed += summary.claimed;
                total.completed += summary.completed;
                total.retried += summary.retried;
                total.dead += summary.dead;
                if summary.claimed == 0 {
                    break;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to drain deferred job queue");
                break;
            }
        }
    }

    if total.claimed == 0 {
        debug!("No deferred jobs due");
        return;
    }

    info!(
        claimed = total.claimed,
        completed = total.completed,
        retried = total.retried,
        dead = total.dead,
        "Deferred job cycle complete"
    );
}

/// Run every cache invariant check for every organization
pub async fn run_invariant_sweep(billing: &BillingService) {
    let organizations = match billing.stores.catalog.organization_ids().await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Failed to list organizations for invariant sweep");
            return;
        }
    };

    let checker = billing.invariant_checker();
    let mut unhealthy = 0;
    let mut errors = 0;

    for organization_id in &organizations {
        match checker.run_all_checks(*organization_id).await {
            Ok(summary) if summary.healthy => {}
            Ok(summary) => {
                unhealthy += 1;
                for violation in &summary.violations {
                    match violation.severity {
                        ViolationSeverity::Critical | ViolationSeverity::High => error!(
                            organization_id = %organization_id,
                            invariant = %violation.invariant,
                            severity = %violation.severity,
                            context = %violation.context,
                            "{}",
                            violation.description
                        ),
                        _ => warn!(
                            organization_id = %organization_id,
                            invariant = %violation.invariant,
                            severity = %violation.severity,
                            context = %violation.context,
                            "{}",
                            violation.description
                        ),
                    }
                }
            }
            Err(e) => {
                errors += 1;
                error!(organization_id = %organization_id, error = %e, "Invariant check failed");
            }
        }
    }

    info!(
        organizations = organizations.len(),
        unhealthy, errors, "Invariant sweep complete"
    );
}

/// Drop finished jobs older than the retention window
pub async fn purge_finished_jobs(billing: &BillingService, retention_days: i64) {
    let retention = Duration::from_secs(retention_days.max(0) as u64 * 24 * 60 * 60);
    match billing.jobs.purge_finished(retention).await {
        Ok(purged) => info!(purged, retention_days, "Finished job cleanup complete"),
        Err(e) => error!(error = %e, "Finished job cleanup failed"),
    }
}
