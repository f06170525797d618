// Runtime cache administration.

use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::AppError;
use crate::handlers::require_metrics_key;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct CacheConfigRequest {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub ttl: Option<u64>,
}

pub(crate) async fn configure_cache_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CacheConfigRequest>,
) -> Result<impl IntoResponse, AppError> {
    require_metrics_key(&state, &headers)?;

    let config = state
        .store
        .cache()
        .reconfigure(request.enabled, request.ttl);
    info!(
        enabled = config.enabled,
        ttl_seconds = config.ttl_seconds,
        "shared store cache reconfigured"
    );

    Ok(Json(json!({ "success": true, "config": config })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use corelay_core::config::AppConfig;
    use corelay_core::store::SharedStore;

    #[tokio::test]
    async fn cache_reconfiguration_round_trips() {
        let state = AppState::new(AppConfig::default(), SharedStore::disabled());
        let response = configure_cache_handler(
            State(state.clone()),
            HeaderMap::new(),
            Json(CacheConfigRequest {
                enabled: Some(false),
                ttl: Some(120),
            }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["config"]["enabled"], false);
        assert_eq!(json["config"]["ttlSeconds"], 120);

        let config = state.store.cache().config();
        assert!(!config.enabled);
        assert_eq!(config.ttl_seconds, 120);
    }
}
