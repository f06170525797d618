// Metrics endpoints and the bearer guard shared with the admin surface.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::IntoResponse;
use serde_json::json;

use crate::error::AppError;
use crate::state::AppState;

/// Outside production the metrics surface is open; in production every
/// request must carry `Authorization: Bearer {METRICS_API_KEY}`.
pub(crate) fn require_metrics_key(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    if !state.config.environment.is_production() {
        return Ok(());
    }

    let configured = state.config.metrics_api_key.as_str();
    if configured.is_empty() {
        return Err(AppError::auth_rejected("metrics access is not configured"));
    }

    let presented = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(key) if key == configured => Ok(()),
        _ => Err(AppError::auth_rejected("invalid metrics key")),
    }
}

pub(crate) async fn metrics_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_metrics_key(&state, &headers)?;
    Ok(Json(state.metrics.summary(false)))
}

pub(crate) async fn metrics_detailed_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_metrics_key(&state, &headers)?;

    let mut summary = state.metrics.summary(true);
    let object = summary.as_object_mut().expect("summary is an object");
    object.insert(
        "performance".to_owned(),
        state.metrics.performance_report(),
    );
    object.insert("cache".to_owned(), json!(state.store.cache().stats()));
    object.insert("droppedWrites".to_owned(), json!(state.store.dropped_writes()));

    Ok(Json(summary))
}
