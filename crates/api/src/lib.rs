// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Meterline API Library
//!
//! HTTP surface over the metering core: event ingestion and voiding, cached
//! aggregation reads, metric retirement and invariant reports.

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
