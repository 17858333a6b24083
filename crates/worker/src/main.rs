//! Meterline Background Worker
//!
//! Handles scheduled jobs including:
//! - Deferred job queue processing (metric retirement cascades)
//! - Cache invariant sweep (hourly)
//! - Finished job cleanup (daily at 3:00 AM UTC)
//! - Heartbeat (every 5 minutes)

mod job_processor;

use std::time::Duration;

use meterline_billing::{BillingConfig, BillingService};
use meterline_shared::{create_pool, init_tracing, Config};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    init_tracing("info,meterline_billing=debug,sqlx=warn");

    info!("Starting Meterline Worker");

    let config = Config::from_env()?;
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    let billing = BillingService::postgres(pool, BillingConfig::from(&config));

    // Create scheduler
    let scheduler = JobScheduler::new().await?;

    // Job 1: Drain the deferred job queue
    // Retirement requests return before their cascade runs; this is what runs it
    let queue_billing = billing.clone();
    scheduler
        .add(Job::new_async(config.job_poll_cron.as_str(), move |_uuid, _l| {
            let billing = queue_billing.clone();
            Box::pin(async move {
                job_processor::process_job_queue(&billing).await;
            })
        })?)
        .await?;
    info!(cron = %config.job_poll_cron, "Scheduled: Deferred job queue processing");

    // Job 2: Cache invariant sweep (hourly, at minute 7 to stay clear of the top of the hour)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 7 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                info!("Running cache invariant sweep");
                job_processor::run_invariant_sweep(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Cache invariant sweep (hourly)");

    // Job 3: Cleanup finished jobs (daily at 3:00 AM UTC)
    let purge_billing = billing.clone();
    let retention_days = config.job_retention_days;
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = purge_billing.clone();
            Box::pin(async move {
                info!("Running finished job cleanup");
                job_processor::purge_finished_jobs(&billing, retention_days).await;
            })
        })?)
        .await?;
    info!("Scheduled: Finished job cleanup (daily at 3:00 AM)");

    // Job 4: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    // Start the scheduler
    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Meterline Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running
    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
