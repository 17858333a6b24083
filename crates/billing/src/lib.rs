// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Meterline Billing Module
//!
//! Incremental usage aggregation for metered billing: a per-coordinate cache
//! of aggregation checkpoints that advances with new events and is destroyed
//! when the events or metrics it depends on change.
//!
//! ## Features
//!
//! - **Aggregation Engine**: deterministic fold of events into count, sum,
//!   max, latest and unique-count aggregates
//! - **Aggregation Cache**: insert-if-absent checkpoints advanced by
//!   compare-and-swap, refreshed up to a settle watermark
//! - **Invalidation**: metric retirement cascade and single-event voids
//! - **Backfill**: one-shot conversion of legacy per-event aggregation records
//! - **Deferred Jobs**: at-least-once queue drained by the worker
//! - **Invariants**: read-only consistency checks

pub mod aggregation;
pub mod backfill;
pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod invariants;
pub mod jobs;
pub mod models;
pub mod store;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

// Aggregation
pub use aggregation::{compute, AggregationKind, AggregationSpec, Aggregator};

// Backfill
pub use backfill::{
    AmbiguityAction, BackfillMigrator, BackfillOptions, BackfillReport, LineageIssue,
    LineagePolicy,
};

// Cache
pub use cache::AggregationCache;

// Config
pub use config::BillingConfig;

// Error
pub use error::{BillingError, BillingResult};

// Invalidation
pub use invalidation::{InvalidationCoordinator, RetirementReport, RetirementTicket, VoidReport};

// Invariants
pub use invariants::{
    CacheInvariantChecker, InvariantCheckSummary, InvariantViolation, ViolationSeverity,
};

// Jobs
pub use jobs::{DeferredJob, EnqueueOutcome, JobRunSummary, JobRunner, JobStatus, RetryPolicy};

// Models
pub use models::{
    AggregationCacheEntry, BillableMetric, CacheCoordinate, Charge, EventCursor, MetricStatus,
    NewUsageEvent, Plan, Subscription, UsageEvent,
};

// Store
pub use store::{InMemoryStore, PgStore, Stores};

// Usage
pub use usage::UsageMeter;

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all metering functionality
#[derive(Clone)]
pub struct BillingService {
    pub stores: Stores,
    pub config: BillingConfig,
    pub cache: AggregationCache,
    pub invalidation: InvalidationCoordinator,
    pub jobs: JobRunner,
    pub usage: UsageMeter,
}

impl BillingService {
    /// Wire the services over arbitrary store backends
    pub fn new(stores: Stores, config: BillingConfig) -> Self {
        let cache = AggregationCache::new(&stores, &config);
        let invalidation = InvalidationCoordinator::new(&stores, cache.clone(), &config);
        let jobs = JobRunner::new(&stores, invalidation.clone(), &config);
        let usage = UsageMeter::new(&stores, cache.clone(), invalidation.clone());

        Self {
            stores,
            config,
            cache,
            invalidation,
            jobs,
            usage,
        }
    }

    /// Create a billing service backed by Postgres
    pub fn postgres(pool: PgPool, config: BillingConfig) -> Self {
        Self::new(Stores::from_backend(Arc::new(PgStore::new(pool))), config)
    }

    /// Create a billing service backed by an in-memory store
    pub fn in_memory(store: Arc<InMemoryStore>, config: BillingConfig) -> Self {
        Self::new(Stores::from_backend(store), config)
    }

    pub fn backfill(&self, options: BackfillOptions) -> BackfillMigrator {
        BackfillMigrator::new(&self.stores, options)
    }

    pub fn invariant_checker(&self) -> CacheInvariantChecker {
        CacheInvariantChecker::new(&self.stores, self.cache.clone(), &self.config)
    }
}
