//! HTTP surface: checkout session routes, the completion page and health.

pub mod checkout;
pub mod common;
pub mod completion;
pub mod health;

use axum::{http::HeaderValue, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::config::AppConfig;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Routes under `/api/v1/checkout`.
pub fn checkout_api_routes() -> Router<AppState> {
    checkout::checkout_routes().merge(completion::completion_routes())
}

/// Full application router with tracing, CORS and request timeouts applied.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let timeout = TimeoutLayer::new(state.config.request_timeout());
    Router::new()
        .nest("/api/v1/checkout", checkout_api_routes())
        .nest("/health", health::health_routes())
        .layer(TraceLayer::new_for_http())
        .layer(timeout)
        .layer(cors)
        .with_state(state)
}

fn cors_layer(cfg: &AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_origins()
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.is_development() {
        info!("Using permissive CORS in the development environment");
        CorsLayer::permissive()
    } else {
        warn!("No CORS origins configured; cross-origin requests will be refused");
        CorsLayer::new()
    }
}
