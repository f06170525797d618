// Liveness and shared-store health endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use chrono::Utc;
use corelay_core::store::HealthStatus;
use serde_json::json;

use crate::error::AppError;
use crate::handlers::require_metrics_key;
use crate::state::AppState;

pub(crate) async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
        "uptime": state.uptime_seconds(),
        "environment": state.config.environment.as_str(),
    }))
}

pub(crate) async fn redis_health_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_metrics_key(&state, &headers)?;

    let health = state.store.health_check().await;
    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::TOO_MANY_REQUESTS,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    let body = json!({
        "status": health.status,
        "responseTime": health.response_time_ms,
        "error": health.error,
        "timestamp": Utc::now(),
        "metrics": {
            "cache": state.store.cache().stats(),
            "droppedWrites": state.store.dropped_writes(),
        },
    });

    Ok((status_code, Json(body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use corelay_core::config::AppConfig;
    use corelay_core::store::SharedStore;

    #[tokio::test]
    async fn health_endpoint_reports_environment_and_uptime() {
        let state = AppState::new(AppConfig::default(), SharedStore::disabled());
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["environment"], "development");
        assert!(json["uptime"].is_u64());
    }

    #[tokio::test]
    async fn offline_store_maps_to_service_unavailable() {
        let state = AppState::new(AppConfig::default(), SharedStore::disabled());
        let response = redis_health_handler(State(state), HeaderMap::new())
            .await
            .unwrap()
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert!(json["error"].is_string());
    }
}
