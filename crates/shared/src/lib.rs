#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Meterline shared infrastructure
//!
//! Configuration, database pool helpers and tracing setup used by the API
//! server, the background worker and the backfill CLI.

pub mod config;
pub mod db;
pub mod telemetry;

pub use config::{Config, ConfigError};
pub use db::{create_migration_pool, create_pool, run_migrations};
pub use telemetry::init_tracing;
