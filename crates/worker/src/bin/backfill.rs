//! One-shot conversion of legacy quantified-event aggregates into cache entries
//!
//! Safe to re-run: coordinates that already have an entry are left alone.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use meterline_billing::{
    AmbiguityAction, BackfillOptions, BillingConfig, BillingService, LineagePolicy,
};
use meterline_shared::{create_migration_pool, create_pool, init_tracing, run_migrations, Config};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "meterline-backfill")]
#[command(about = "Backfill aggregation cache entries from legacy quantified events")]
struct Cli {
    /// What to do with a record whose charge can't be determined: "skip" or "halt"
    #[arg(long, default_value = "skip")]
    on_ambiguity: AmbiguityAction,

    /// How to choose between several candidate charges: "strict" or "most-recent-subscription"
    #[arg(long, default_value = "strict")]
    lineage_policy: LineagePolicy,

    /// JSON file mapping legacy record ids to the charge ids they belong to
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Legacy records read per page
    #[arg(long, default_value_t = 500)]
    batch_size: i64,

    /// Resolve lineage and report without writing anything
    #[arg(long)]
    dry_run: bool,

    /// Apply pending migrations before running
    #[arg(long)]
    migrate: bool,
}

fn load_overrides(path: Option<&PathBuf>) -> anyhow::Result<HashMap<Uuid, Uuid>> {
    let Some(path) = path else {
        return Ok(HashMap::new());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading overrides from {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing overrides in {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing("info,meterline_billing=debug,sqlx=warn");

    let cli = Cli::parse();
    let config = Config::from_env()?;

    if cli.migrate {
        let migration_pool = create_migration_pool(config.migration_url()).await?;
        run_migrations(&migration_pool).await?;
    }

    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    let billing = BillingService::postgres(pool, BillingConfig::from(&config));

    let options = BackfillOptions {
        policy: cli.lineage_policy,
        on_ambiguity: cli.on_ambiguity,
        overrides: load_overrides(cli.overrides.as_ref())?,
        batch_size: cli.batch_size.max(1),
        dry_run: cli.dry_run,
    };
    info!(
        policy = ?options.policy,
        on_ambiguity = ?options.on_ambiguity,
        overrides = options.overrides.len(),
        dry_run = options.dry_run,
        "Starting aggregation cache backfill"
    );

    let report = billing.backfill(options).run().await?;
    if !report.flagged.is_empty() {
        warn!(
            flagged = report.flagged.len(),
            "Some legacy records need manual lineage resolution"
        );
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
