// Router configuration

use axum::http::{HeaderValue, Method};
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::handlers::{
    configure_cache_handler, health_handler, metrics_detailed_handler, metrics_handler,
    redis_health_handler,
};
use crate::socket;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    let (socket_layer, socket_io) = socket::build_socket_layer(state.clone());
    state.emitter.bind(socket_io);

    let cors = CorsLayer::new()
        .allow_origin(allowed_origin(&state.config.cors_origin))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/detailed", get(metrics_detailed_handler))
        .route("/health/redis", get(redis_health_handler))
        .route("/admin/redis/cache", post(configure_cache_handler))
        .layer(socket_layer)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn allowed_origin(origin: &str) -> AllowOrigin {
    match HeaderValue::from_str(origin) {
        Ok(value) => AllowOrigin::exact(value),
        Err(_) => {
            warn!(origin, "invalid CORS origin; mirroring request origin");
            AllowOrigin::mirror_request()
        }
    }
}
