//! Billable metric retirement and consistency reports

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use meterline_billing::{InvariantCheckSummary, RetirementTicket};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

/// DELETE /v1/organizations/{organization_id}/billable_metrics/{metric_id}
///
/// Accepted, not done: the event purge and cache cascade run in the worker.
pub async fn retire_metric(
    State(state): State<AppState>,
    Path((organization_id, metric_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<(StatusCode, Json<RetirementTicket>)> {
    let ticket = state
        .billing
        .invalidation
        .request_retirement(organization_id, metric_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

/// GET /v1/organizations/{organization_id}/invariants
pub async fn check_invariants(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
) -> ApiResult<Json<InvariantCheckSummary>> {
    let summary = state
        .billing
        .invariant_checker()
        .run_all_checks(organization_id)
        .await?;
    Ok(Json(summary))
}
