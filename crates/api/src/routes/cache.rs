//! Cached aggregation reads and refreshes

use axum::{
    extract::{Path, Query, State},
    Json,
};
use meterline_billing::{AggregationCacheEntry, CacheCoordinate};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Identifies one cache coordinate within the organization in the path
#[derive(Debug, Deserialize)]
pub struct CoordinateParams {
    pub external_subscription_id: String,
    pub charge_id: Uuid,
    pub group_id: Option<Uuid>,
    pub charge_filter_id: Option<Uuid>,
}

impl CoordinateParams {
    fn into_coordinate(self, organization_id: Uuid) -> CacheCoordinate {
        CacheCoordinate {
            organization_id,
            external_subscription_id: self.external_subscription_id,
            charge_id: self.charge_id,
            group_id: self.group_id,
            charge_filter_id: self.charge_filter_id,
        }
    }
}

/// GET /v1/organizations/{organization_id}/cached_aggregations
pub async fn get_cached_aggregation(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Query(params): Query<CoordinateParams>,
) -> ApiResult<Json<AggregationCacheEntry>> {
    let coordinate = params.into_coordinate(organization_id);
    state
        .billing
        .cache
        .find(&coordinate)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "No cached aggregation for charge {} and subscription {}",
                coordinate.charge_id, coordinate.external_subscription_id
            ))
        })
}

/// POST /v1/organizations/{organization_id}/cached_aggregations/refresh
pub async fn refresh_cached_aggregation(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Json(params): Json<CoordinateParams>,
) -> ApiResult<Json<AggregationCacheEntry>> {
    let coordinate = params.into_coordinate(organization_id);
    let entry = state.billing.cache.refresh(&coordinate).await?;
    Ok(Json(entry))
}
