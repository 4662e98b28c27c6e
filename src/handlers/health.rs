use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use serde_json::json;
use std::time::Instant;

use crate::AppState;

const PROBE_KEY: &str = "health:probe";

/// Component health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: String,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub journal: ComponentHealth,
    pub active_sessions: usize,
    pub providers: Vec<String>,
}

/// Tracks application start time for uptime calculation
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call this on application startup)
pub fn init_start_time() {
    let _ = START_TIME.get_or_init(Instant::now);
}

fn uptime_secs() -> u64 {
    START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0)
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(health_check))
        .route("/live", get(liveness_check))
}

async fn liveness_check() -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Round-trips a probe entry through the journal storage.
async fn check_journal(state: &AppState) -> ComponentHealth {
    let started = Instant::now();
    let result = async {
        state.storage.set(PROBE_KEY, "ok").await?;
        state.storage.delete(PROBE_KEY).await
    }
    .await;
    let latency_ms = Some(started.elapsed().as_millis() as u64);
    match result {
        Ok(()) => ComponentHealth {
            status: ComponentStatus::Up,
            message: "journal storage writable".to_string(),
            latency_ms,
        },
        Err(e) => ComponentHealth {
            status: ComponentStatus::Down,
            message: e.to_string(),
            latency_ms,
        },
    }
}

/// Journal storage down is reported as degraded: checkouts still run, only
/// recovery after a lost page is affected.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let journal = check_journal(&state).await;
    let (status, code) = match journal.status {
        ComponentStatus::Up => (ComponentStatus::Up, StatusCode::OK),
        _ => (ComponentStatus::Degraded, StatusCode::SERVICE_UNAVAILABLE),
    };
    let body = HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: uptime_secs(),
        journal,
        active_sessions: state.sessions.len(),
        providers: state
            .checkout
            .providers
            .kinds()
            .into_iter()
            .map(|k| k.to_string())
            .collect(),
    };
    (code, Json(body))
}
