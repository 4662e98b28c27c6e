//! Wire contract of the provider APIs the adapters talk to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::PaymentDetails;

/// Customer fields a provider needs to open an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerRef {
    pub full_name: String,
    pub email: String,
    pub phone: String,
}

/// Identifies one checkout attempt towards a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutAttempt {
    /// Stable per attempt so a repeated create returns the same intent.
    pub idempotency_key: String,
    /// Where redirect-based providers send the customer back to.
    pub return_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateIntentRequest {
    pub amount_minor_units: i64,
    pub currency: String,
    pub customer: CustomerRef,
    pub reference: String,
    pub return_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmIntentRequest {
    pub payment_method: PaymentDetails,
    pub return_url: String,
}

/// Provider view of an intent. `status` is the provider's own vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentResponse {
    pub intent_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Error body returned by provider APIs on non-2xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorBody {
    pub error: ProviderErrorDetail,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("declined: {message}")]
    Declined {
        code: Option<String>,
        message: String,
    },
    #[error("cancelled by customer")]
    Cancelled,
    #[error("intent {0} not found")]
    NotFound(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Endpoints a provider exposes. Implemented over HTTP and by the sandbox.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
        idempotency_key: &str,
    ) -> Result<IntentResponse, ProviderClientError>;

    async fn confirm_intent(
        &self,
        intent_id: &str,
        request: ConfirmIntentRequest,
    ) -> Result<IntentResponse, ProviderClientError>;

    async fn capture_intent(&self, intent_id: &str) -> Result<IntentResponse, ProviderClientError>;

    async fn cancel_intent(&self, intent_id: &str) -> Result<IntentResponse, ProviderClientError>;

    async fn retrieve_intent(&self, intent_id: &str)
        -> Result<IntentResponse, ProviderClientError>;
}
