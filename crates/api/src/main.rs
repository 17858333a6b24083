//! Meterline API Server
//!
//! Serves the metering HTTP API. Scheduled and deferred work runs in
//! `meterline-worker`.

use std::net::SocketAddr;

use meterline_api::{create_router, AppState};
use meterline_billing::{BillingConfig, BillingService};
use meterline_shared::{create_migration_pool, create_pool, init_tracing, run_migrations, Config};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    init_tracing("info,meterline_api=debug,meterline_billing=debug,sqlx=warn");

    tracing::info!("Starting Meterline API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    // Run migrations using direct URL (bypasses poolers that lack prepared statements)
    tracing::info!("Running database migrations...");
    let migration_pool = create_migration_pool(config.migration_url()).await?;
    run_migrations(&migration_pool).await?;
    migration_pool.close().await;

    // Create database pool (using pooler URL for regular queries)
    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    tracing::info!("Database connection established");

    let billing = BillingService::postgres(pool, BillingConfig::from(&config));
    let state = AppState::new(billing);

    let app = create_router(state)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
