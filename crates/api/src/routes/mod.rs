//! HTTP routes
//!
//! Everything except the health probe is scoped to an organization:
//! `/v1/organizations/{organization_id}/...`

pub mod cache;
pub mod events;
pub mod metrics;

use axum::{
    extract::State,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use time::OffsetDateTime;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (OffsetDateTime::now_utc() - state.started_at).whole_seconds(),
    })
}

pub fn create_router(state: AppState) -> Router {
    let organization_routes = Router::new()
        .route("/events", post(events::record_event))
        .route("/events/batch", post(events::record_events))
        .route("/events/{event_id}", delete(events::void_event))
        .route("/cached_aggregations", get(cache::get_cached_aggregation))
        .route(
            "/cached_aggregations/refresh",
            post(cache::refresh_cached_aggregation),
        )
        .route(
            "/billable_metrics/{metric_id}",
            delete(metrics::retire_metric),
        )
        .route("/invariants", get(metrics::check_invariants));

    Router::new()
        .route("/health", get(health))
        .nest("/v1/organizations/{organization_id}", organization_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use meterline_billing::{
        BillableMetric, BillingConfig, BillingService, Charge, InMemoryStore, Plan, Subscription,
    };
    use rust_decimal::Decimal;
    use serde_json::{json, Value};
    use time::macros::datetime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;

    struct TestApp {
        router: Router,
        org: Uuid,
        metric: BillableMetric,
        charge: Charge,
    }

    async fn test_app() -> TestApp {
        let store = Arc::new(InMemoryStore::new());
        let org = Uuid::new_v4();
        let metric = BillableMetric::new(org, "api_calls", "sum").with_field("count");
        let plan = Plan {
            id: Uuid::new_v4(),
            organization_id: org,
            code: "base".to_string(),
        };
        let charge = Charge {
            id: Uuid::new_v4(),
            organization_id: org,
            plan_id: plan.id,
            billable_metric_id: metric.id,
            filter_ids: Vec::new(),
        };
        store.insert_metric(metric.clone()).await;
        store.insert_plan(plan.clone()).await;
        store.insert_charge(charge.clone()).await;
        store
            .insert_subscription(Subscription {
                id: Uuid::new_v4(),
                organization_id: org,
                external_id: "sub_1".to_string(),
                plan_id: plan.id,
                status: "active".to_string(),
                started_at: datetime!(2024-01-01 00:00 UTC),
            })
            .await;

        let config = BillingConfig {
            settle_window: std::time::Duration::ZERO,
            ..BillingConfig::default()
        };
        let billing = BillingService::in_memory(store, config);

        TestApp {
            router: create_router(AppState::new(billing)),
            org,
            metric,
            charge,
        }
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn decimal(value: &Value) -> Decimal {
        value.as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_app().await;
        let (status, body) = send(&app.router, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_record_then_refresh_and_read() {
        let app = test_app().await;
        let base = format!("/v1/organizations/{}", app.org);

        for count in [2, 5] {
            let (status, _) = send(
                &app.router,
                Method::POST,
                &format!("{base}/events"),
                Some(json!({
                    "external_subscription_id": "sub_1",
                    "code": "api_calls",
                    "properties": { "count": count }
                })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let query = format!(
            "{base}/cached_aggregations?external_subscription_id=sub_1&charge_id={}",
            app.charge.id
        );
        let (status, _) = send(&app.router, Method::GET, &query, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &app.router,
            Method::POST,
            &format!("{base}/cached_aggregations/refresh"),
            Some(json!({ "external_subscription_id": "sub_1", "charge_id": app.charge.id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["current_aggregation"]), Decimal::from(7));

        let (status, body) = send(&app.router, Method::GET, &query, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["current_aggregation"]), Decimal::from(7));
    }

    #[tokio::test]
    async fn test_blank_code_is_rejected() {
        let app = test_app().await;
        let (status, body) = send(
            &app.router,
            Method::POST,
            &format!("/v1/organizations/{}/events", app.org),
            Some(json!({ "external_subscription_id": "sub_1", "code": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], 422);
    }

    #[tokio::test]
    async fn test_batch_with_invalid_event_records_nothing() {
        let app = test_app().await;
        let base = format!("/v1/organizations/{}", app.org);

        let (status, body) = send(
            &app.router,
            Method::POST,
            &format!("{base}/events/batch"),
            Some(json!({
                "events": [
                    { "external_subscription_id": "sub_1", "code": "api_calls", "properties": { "count": 4 } },
                    { "external_subscription_id": "sub_1", "code": "" }
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("event 1"));

        let (status, body) = send(
            &app.router,
            Method::POST,
            &format!("{base}/cached_aggregations/refresh"),
            Some(json!({ "external_subscription_id": "sub_1", "charge_id": app.charge.id })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decimal(&body["current_aggregation"]), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_void_event_destroys_entry() {
        let app = test_app().await;
        let base = format!("/v1/organizations/{}", app.org);

        let (_, event) = send(
            &app.router,
            Method::POST,
            &format!("{base}/events"),
            Some(json!({
                "external_subscription_id": "sub_1",
                "code": "api_calls",
                "properties": { "count": 3 }
            })),
        )
        .await;
        send(
            &app.router,
            Method::POST,
            &format!("{base}/cached_aggregations/refresh"),
            Some(json!({ "external_subscription_id": "sub_1", "charge_id": app.charge.id })),
        )
        .await;

        let (status, body) = send(
            &app.router,
            Method::DELETE,
            &format!("{base}/events/{}", event["id"].as_str().unwrap()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["voided"], true);
        assert_eq!(body["entries_destroyed"], 1);

        let (status, _) = send(
            &app.router,
            Method::DELETE,
            &format!("{base}/events/{}", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retire_metric_is_accepted_and_blocks_refresh() {
        let app = test_app().await;
        let base = format!("/v1/organizations/{}", app.org);

        let (status, body) = send(
            &app.router,
            Method::DELETE,
            &format!("{base}/billable_metrics/{}", app.metric.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "pending_deletion");

        let (status, _) = send(
            &app.router,
            Method::POST,
            &format!("{base}/cached_aggregations/refresh"),
            Some(json!({ "external_subscription_id": "sub_1", "charge_id": app.charge.id })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_invariants_report_is_healthy() {
        let app = test_app().await;
        let (status, body) = send(
            &app.router,
            Method::GET,
            &format!("/v1/organizations/{}/invariants", app.org),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["healthy"], true);
    }
}
