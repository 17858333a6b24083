//! Billing error types

use thiserror::Error;
use uuid::Uuid;

use crate::backfill::LineageIssue;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Unsupported aggregation kind: {0}")]
    UnsupportedAggregationKind(String),

    #[error("Coordinate does not match metric dimensions: {0}")]
    EmptyGroupMismatch(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Billable metric {0} is retired")]
    MetricRetired(Uuid),

    #[error("Cannot resolve lineage for legacy record {record_id}: {issue}")]
    LineageAmbiguity { record_id: Uuid, issue: LineageIssue },

    #[error("Cache entry {0} was modified concurrently")]
    CacheConflict(Uuid),

    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Invalidation incomplete for metric {metric_id}: {reason}")]
    InvalidationIncomplete { metric_id: Uuid, reason: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BillingError {
    /// Whether re-running the failed operation is safe and may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BillingError::CacheConflict(_)
                | BillingError::TransientStorage(_)
                | BillingError::InvalidationIncomplete { .. }
        )
    }

    /// Errors caused by a malformed request rather than system state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BillingError::UnsupportedAggregationKind(_)
                | BillingError::EmptyGroupMismatch(_)
                | BillingError::Validation(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // unique_violation, serialization_failure, deadlock_detected
                Some("23505") | Some("40001") | Some("40P01") => {
                    BillingError::TransientStorage(err.to_string())
                }
                _ => BillingError::Database(err.to_string()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                BillingError::TransientStorage(err.to_string())
            }
            _ => BillingError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Serialization(err.to_string())
    }
}
