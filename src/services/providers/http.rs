use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, instrument};

use super::client::{
    ConfirmIntentRequest, CreateIntentRequest, IntentResponse, ProviderClient,
    ProviderClientError, ProviderErrorBody,
};
use crate::config::ProviderEndpoint;
use crate::errors::CheckoutError;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Provider API client over HTTPS with bearer authentication.
#[derive(Debug, Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    api_key: String,
}

impl HttpProviderClient {
    pub fn new(endpoint: &ProviderEndpoint, timeout: Duration) -> Result<Self, CheckoutError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CheckoutError::Config(format!("failed to build provider client: {}", e)))?;
        Ok(Self {
            http,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(&self, request: RequestBuilder) -> Result<IntentResponse, ProviderClientError> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderClientError::Timeout
                } else {
                    ProviderClientError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<IntentResponse>()
                .await
                .map_err(|e| ProviderClientError::Malformed(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), "provider returned error response");
        Err(classify_error(status, body))
    }
}

fn classify_error(status: StatusCode, body: String) -> ProviderClientError {
    let detail = serde_json::from_str::<ProviderErrorBody>(&body)
        .ok()
        .map(|b| b.error);

    let error_type = detail.as_ref().map(|d| d.error_type.as_str());
    match (status, error_type) {
        (_, Some("user_cancelled")) => ProviderClientError::Cancelled,
        (StatusCode::PAYMENT_REQUIRED, _) | (_, Some("card_declined" | "payment_declined")) => {
            let (code, message) = detail
                .map(|d| (d.code, d.message.unwrap_or_else(|| "payment declined".into())))
                .unwrap_or((None, "payment declined".into()));
            ProviderClientError::Declined { code, message }
        }
        (StatusCode::NOT_FOUND, _) => ProviderClientError::NotFound(body),
        _ => ProviderClientError::Status {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[instrument(skip(self, request), fields(reference = %request.reference))]
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
        idempotency_key: &str,
    ) -> Result<IntentResponse, ProviderClientError> {
        self.send(
            self.http
                .post(self.url("intents"))
                .header(IDEMPOTENCY_HEADER, idempotency_key)
                .json(&request),
        )
        .await
    }

    #[instrument(skip(self, request))]
    async fn confirm_intent(
        &self,
        intent_id: &str,
        request: ConfirmIntentRequest,
    ) -> Result<IntentResponse, ProviderClientError> {
        self.send(
            self.http
                .post(self.url(&format!("intents/{}/confirm", intent_id)))
                .json(&request),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn capture_intent(&self, intent_id: &str) -> Result<IntentResponse, ProviderClientError> {
        self.send(self.http.post(self.url(&format!("intents/{}/capture", intent_id))))
            .await
    }

    #[instrument(skip(self))]
    async fn cancel_intent(&self, intent_id: &str) -> Result<IntentResponse, ProviderClientError> {
        self.send(self.http.post(self.url(&format!("intents/{}/cancel", intent_id))))
            .await
    }

    #[instrument(skip(self))]
    async fn retrieve_intent(
        &self,
        intent_id: &str,
    ) -> Result<IntentResponse, ProviderClientError> {
        self.send(self.http.get(self.url(&format!("intents/{}", intent_id))))
            .await
    }
}
