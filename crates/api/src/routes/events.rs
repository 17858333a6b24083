//! Usage event ingestion and voiding

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use meterline_billing::{NewUsageEvent, UsageEvent, VoidReport};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Largest batch accepted by a single ingestion request
const MAX_BATCH_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RecordEventRequest {
    pub external_subscription_id: String,
    pub code: String,
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub charge_filter_id: Option<Uuid>,
    #[serde(default)]
    pub properties: Option<serde_json::Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub recorded_at: Option<OffsetDateTime>,
}

impl RecordEventRequest {
    fn into_event(self, organization_id: Uuid) -> NewUsageEvent {
        NewUsageEvent {
            organization_id,
            external_subscription_id: self.external_subscription_id,
            code: self.code,
            group_id: self.group_id,
            charge_filter_id: self.charge_filter_id,
            properties: self
                .properties
                .unwrap_or_else(|| serde_json::Value::Object(Default::default())),
            recorded_at: self.recorded_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RecordBatchRequest {
    pub events: Vec<RecordEventRequest>,
}

/// POST /v1/organizations/{organization_id}/events
pub async fn record_event(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Json(request): Json<RecordEventRequest>,
) -> ApiResult<(StatusCode, Json<UsageEvent>)> {
    let event = state
        .billing
        .usage
        .record_event(request.into_event(organization_id))
        .await?;
    Ok((StatusCode::CREATED, Json(event)))
}

/// POST /v1/organizations/{organization_id}/events/batch
pub async fn record_events(
    State(state): State<AppState>,
    Path(organization_id): Path<Uuid>,
    Json(request): Json<RecordBatchRequest>,
) -> ApiResult<(StatusCode, Json<Vec<UsageEvent>>)> {
    if request.events.is_empty() {
        return Err(ApiError::Validation("events must not be empty".to_string()));
    }
    if request.events.len() > MAX_BATCH_SIZE {
        return Err(ApiError::Validation(format!(
            "at most {} events per batch",
            MAX_BATCH_SIZE
        )));
    }

    let events = request
        .events
        .into_iter()
        .map(|e| e.into_event(organization_id))
        .collect();
    let recorded = state.billing.usage.record_events(events).await?;
    Ok((StatusCode::CREATED, Json(recorded)))
}

/// DELETE /v1/organizations/{organization_id}/events/{event_id}
pub async fn void_event(
    State(state): State<AppState>,
    Path((organization_id, event_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<Json<VoidReport>> {
    let report = state
        .billing
        .invalidation
        .void_event(organization_id, event_id)
        .await?;
    Ok(Json(report))
}
