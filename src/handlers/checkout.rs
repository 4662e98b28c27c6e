use axum::{
    extract::{Path, State},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::common::{created_response, success_response, ApiResponse};
use crate::{
    errors::CheckoutError,
    models::{Cart, DeliveryDetails, PaymentDetails, ProviderKind},
    services::{CheckoutSession, ReportedRuntime, SessionSnapshot},
    AppState,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub cart: Cart,
    #[serde(default)]
    pub runtime: ReportedRuntime,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectProviderRequest {
    pub provider_kind: ProviderKind,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayRequest {
    pub payment_details: PaymentDetails,
}

pub fn checkout_routes() -> Router<AppState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/details", post(submit_details))
        .route("/sessions/:id/details/edit", post(edit_details))
        .route("/sessions/:id/provider", post(select_provider))
        .route("/sessions/:id/pay", post(pay))
        .route("/sessions/:id/return", post(resume))
        .route("/sessions/:id/abandon", post(abandon))
        .route("/sessions/:id/retry", post(retry))
}

/// Looks up a live session and applies its lifetime limits before use.
async fn session_handle(
    state: &AppState,
    id: Uuid,
) -> Result<Arc<Mutex<CheckoutSession>>, CheckoutError> {
    let handle = state
        .sessions
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or(CheckoutError::SessionNotFound(id))?;
    handle.lock().await.expire_if_stale(Utc::now()).await?;
    Ok(handle)
}

async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Response, CheckoutError> {
    let profile = state.profiler.profile(&request.runtime);
    let session = CheckoutSession::start(state.checkout.clone(), request.cart, profile).await?;
    let snapshot = session.snapshot();
    state
        .sessions
        .insert(snapshot.session_id, Arc::new(Mutex::new(session)));
    Ok(created_response(snapshot))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let snapshot = handle.lock().await.snapshot();
    Ok(success_response(snapshot))
}

async fn submit_details(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(details): Json<DeliveryDetails>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let prompt = handle.lock().await.submit_details(details).await?;
    Ok(success_response(prompt))
}

async fn edit_details(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let mut session = handle.lock().await;
    session.edit_details().await?;
    Ok(success_response(session.snapshot()))
}

async fn select_provider(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<SelectProviderRequest>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let choice = handle
        .lock()
        .await
        .select_provider(request.provider_kind)
        .await?;
    Ok(success_response(choice))
}

async fn pay(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PayRequest>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let outcome = handle
        .lock()
        .await
        .begin_payment(request.payment_details)
        .await?;
    Ok(success_response(outcome))
}

async fn resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let outcome = handle.lock().await.resume_after_redirect().await?;
    Ok(success_response(outcome))
}

async fn abandon(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<SessionSnapshot>>, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let mut session = handle.lock().await;
    session.abandon().await?;
    Ok(Json(
        ApiResponse::ok(session.snapshot()).with_message("checkout abandoned"),
    ))
}

async fn retry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Response, CheckoutError> {
    let handle = session_handle(&state, id).await?;
    let next = handle.lock().await.retry_attempt().await?;
    let snapshot = next.snapshot();
    info!(previous = %id, session_id = %snapshot.session_id, "checkout retry session created");
    state
        .sessions
        .insert(snapshot.session_id, Arc::new(Mutex::new(next)));
    Ok(created_response(snapshot))
}
