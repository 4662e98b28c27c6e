//! HTTP surface tests driven through the router with `oneshot`.

mod common;

use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use common::{RecordingNotifier, DESKTOP_UA, IN_APP_UA};
use serde_json::{json, Value};
use storefront_checkout::{
    config::config_from_toml,
    handlers,
    models::ProviderKind,
    services::{providers::SandboxProviderClient, ProviderRegistry},
    storage::InMemoryStorage,
    AppState,
};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    state: AppState,
    notifier: Arc<RecordingNotifier>,
}

impl TestApp {
    fn new() -> Self {
        let config = config_from_toml("").expect("default config is valid");
        let providers = ProviderRegistry::standard(
            Arc::new(SandboxProviderClient::new(ProviderKind::Card)),
            Arc::new(SandboxProviderClient::new(ProviderKind::RedirectWallet)),
            Arc::new(SandboxProviderClient::new(ProviderKind::BankDebit)),
        );
        let notifier = Arc::new(RecordingNotifier::default());
        let state = AppState::assemble(
            config,
            Arc::new(InMemoryStorage::new()),
            providers,
            notifier.clone(),
            None,
        )
        .expect("state builds");
        Self {
            router: handlers::router(state.clone()),
            state,
            notifier,
        }
    }

    async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request builds");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router responds")
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = self.request(Method::POST, uri, Some(body)).await;
        (response.status(), response_json(response).await)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let response = self.request(Method::GET, uri, None).await;
        (response.status(), response_json(response).await)
    }

    async fn create_session(&self, user_agent: &str) -> String {
        let (status, body) = self
            .post(
                "/api/v1/checkout/sessions",
                json!({
                    "cart": { "items": [
                        { "catalog_id": "jollof-rice", "name": "Jollof Rice", "unit_price": "8.99", "quantity": 2 },
                        { "catalog_id": "puff-puff", "name": "Puff Puff", "unit_price": "4.00", "quantity": 1 }
                    ]},
                    "runtime": { "userAgent": user_agent, "storageAvailable": true }
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body["data"]["sessionId"].as_str().unwrap().to_string()
    }
}

async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

fn pickup() -> Value {
    json!({
        "full_name": "Ada Obi",
        "email": "ada@example.com",
        "phone": "+44 7700 900123",
        "fulfillment_mode": "pickup"
    })
}

#[tokio::test]
async fn health_reports_journal_and_version() {
    let app = TestApp::new();
    let (status, body) = app.get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
    assert_eq!(body["journal"]["status"], "up");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));

    let (status, body) = app.get("/health/live").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "up");
}

#[tokio::test]
async fn card_checkout_over_http() {
    let app = TestApp::new();
    let id = app.create_session(DESKTOP_UA).await;
    let base = format!("/api/v1/checkout/sessions/{id}");

    let (status, body) = app.post(&format!("{base}/details"), pickup()).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["suggestedProvider"], "card");
    assert_eq!(body["data"]["quote"]["total"], "21.98");

    let (status, body) = app
        .post(&format!("{base}/provider"), json!({ "providerKind": "card" }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["strategy"], "immediate_callback");

    let (status, body) = app
        .post(
            &format!("{base}/pay"),
            json!({ "paymentDetails": { "method": "card", "token": "tok_visa" } }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["outcome"], "finalized");
    assert_eq!(body["data"]["order"]["total"], "21.98");
    assert_eq!(body["data"]["next"]["mode"]["kind"], "immediate");
    let order_id = body["data"]["order"]["order_id"].as_str().unwrap().to_string();

    let (_, body) = app.get(&base).await;
    assert_eq!(body["data"]["state"], "finalized");

    // advisory amount in the URL is ignored
    let (status, body) = app
        .get(&format!("/api/v1/checkout/complete?orderId={order_id}&amount=0.01"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "confirmed");
    assert_eq!(body["data"]["order"]["total"], "21.98");
    assert_eq!(app.notifier.calls(), 1);
}

#[tokio::test]
async fn wallet_return_is_finished_by_the_completion_page() {
    let app = TestApp::new();
    let id = app.create_session(DESKTOP_UA).await;
    let base = format!("/api/v1/checkout/sessions/{id}");
    app.post(&format!("{base}/details"), pickup()).await;
    app.post(&format!("{base}/provider"), json!({ "providerKind": "redirect_wallet" }))
        .await;

    let (status, body) = app
        .post(&format!("{base}/pay"), json!({ "paymentDetails": { "method": "wallet" } }))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["outcome"], "provider_redirect");

    let (_, body) = app
        .get(&format!("/api/v1/checkout/complete?sessionId={id}&providerKind=redirect_wallet"))
        .await;
    assert_eq!(body["data"]["status"], "confirmed");

    // manual check agrees after the journal entry is gone
    let (status, body) = app
        .post(&format!("/api/v1/checkout/complete/{id}/check"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "confirmed");
}

#[tokio::test]
async fn in_app_browser_is_steered_to_the_wallet() {
    let app = TestApp::new();
    let id = app.create_session(IN_APP_UA).await;

    let (_, body) = app.get(&format!("/api/v1/checkout/sessions/{id}")).await;
    assert_eq!(body["data"]["profile"]["is_restricted_runtime"], true);
    assert_eq!(body["data"]["suggestedProvider"], "redirect_wallet");

    app.post(&format!("/api/v1/checkout/sessions/{id}/details"), pickup())
        .await;
    let (_, body) = app
        .post(
            &format!("/api/v1/checkout/sessions/{id}/provider"),
            json!({ "providerKind": "card" }),
        )
        .await;
    assert_eq!(body["data"]["strategy"], "manual_continuation");
    assert_eq!(body["data"]["warning"]["recommended_provider"], "redirect_wallet");
}

#[tokio::test]
async fn invalid_details_return_field_errors() {
    let app = TestApp::new();
    let id = app.create_session(DESKTOP_UA).await;

    let (status, body) = app
        .post(
            &format!("/api/v1/checkout/sessions/{id}/details"),
            json!({
                "full_name": "Ada Obi",
                "email": "not-an-email",
                "phone": "+44 7700 900123",
                "fulfillment_mode": "delivery"
            }),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");
    let fields: Vec<&str> = body["fields"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|f| f["field"].as_str())
        .collect();
    for field in ["email", "address", "city", "postcode"] {
        assert!(fields.contains(&field), "missing {field} in {fields:?}");
    }
}

#[tokio::test]
async fn unknown_session_is_not_found() {
    let app = TestApp::new();
    let (status, body) = app
        .get(&format!("/api/v1/checkout/sessions/{}", uuid::Uuid::new_v4()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "session_not_found");
}

#[tokio::test]
async fn empty_cart_is_rejected() {
    let app = TestApp::new();
    let (status, body) = app
        .post("/api/v1/checkout/sessions", json!({ "cart": { "items": [] } }))
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "empty_cart");
    assert!(app.state.sessions.is_empty());
}

#[tokio::test]
async fn zero_quantity_line_names_the_field() {
    let app = TestApp::new();
    let (status, body) = app
        .post(
            "/api/v1/checkout/sessions",
            json!({ "cart": { "items": [
                { "catalog_id": "suya", "name": "Suya", "unit_price": "6.50", "quantity": 0 }
            ]}}),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(body["fields"][0]["field"], "items[0].quantity");
    assert!(app.state.sessions.is_empty());
}

#[tokio::test]
async fn out_of_order_calls_conflict() {
    let app = TestApp::new();
    let id = app.create_session(DESKTOP_UA).await;
    let (status, body) = app
        .post(
            &format!("/api/v1/checkout/sessions/{id}/pay"),
            json!({ "paymentDetails": { "method": "card", "token": "tok_visa" } }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[tokio::test]
async fn abandon_reports_the_final_snapshot() {
    let app = TestApp::new();
    let id = app.create_session(DESKTOP_UA).await;
    let (status, body) = app
        .post(&format!("/api/v1/checkout/sessions/{id}/abandon"), json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "abandoned");
    assert_eq!(body["message"], "checkout abandoned");
}

#[tokio::test]
async fn completion_page_without_context_is_unknown() {
    let app = TestApp::new();
    let (status, body) = app
        .get("/api/v1/checkout/complete?amount=21.98&providerKind=card&timestamp=1760000000000")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "unknown");
    assert_eq!(body["data"]["receipt"]["authoritative"], false);
    assert_eq!(body["data"]["receipt"]["amount"], "21.98");
}

#[tokio::test]
async fn sweep_drops_settled_sessions_past_their_horizon() {
    let app = TestApp::new();
    let id = app.create_session(DESKTOP_UA).await;
    app.post(&format!("/api/v1/checkout/sessions/{id}/abandon"), json!({}))
        .await;

    assert_eq!(app.state.sweep_sessions(chrono::Utc::now()).await, 0);
    let later = chrono::Utc::now() + chrono::Duration::hours(1);
    assert_eq!(app.state.sweep_sessions(later).await, 1);
    assert!(app.state.sessions.is_empty());
}
