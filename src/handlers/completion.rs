use axum::{
    extract::{Path, RawQuery, State},
    response::Response,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use super::common::success_response;
use crate::{services::CompletionParams, AppState};

pub fn completion_routes() -> Router<AppState> {
    Router::new()
        .route("/complete", get(load_completion))
        .route("/complete/:session_id/check", post(check_status))
}

/// Landing page for provider returns. Query parameters only locate the
/// journal entry; totals come from the provider and the journal.
async fn load_completion(State(state): State<AppState>, RawQuery(query): RawQuery) -> Response {
    let params = CompletionParams::from_query(query.as_deref().unwrap_or_default());
    success_response(state.gateway.load(&params).await)
}

async fn check_status(State(state): State<AppState>, Path(session_id): Path<Uuid>) -> Response {
    success_response(state.gateway.check_status(session_id).await)
}
