use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::ProviderKind;
use crate::storage::StorageError;

/// Field-level validation problem, rendered inline next to the offending input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// All field problems found while validating a single submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    pub fields: Vec<FieldError>,
}

impl ValidationFailure {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            fields: vec![FieldError {
                field: field.into(),
                message: message.into(),
            }],
        }
    }

    pub fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.fields.push(FieldError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_field(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f.field == field)
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .fields
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

impl From<validator::ValidationErrors> for ValidationFailure {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut failure = ValidationFailure::default();
        let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
        fields.sort_by_key(|(field, _)| *field);
        for (field, errs) in fields {
            for err in errs {
                let message = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| err.code.to_string());
                failure.push(field, message);
            }
        }
        failure
    }
}

/// Checkout error taxonomy.
///
/// Provider-specific failures are normalized into `ProviderUnavailable`,
/// `DeclinedByProvider` and `UserCancelled` at the adapter boundary, so the
/// session never sees a provider's own error shapes.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("Validation error: {0}")]
    Validation(ValidationFailure),

    #[error("Payment provider {provider} unavailable: {message}")]
    ProviderUnavailable {
        provider: ProviderKind,
        message: String,
    },

    #[error("Payment declined by {provider}: {message}")]
    DeclinedByProvider {
        provider: ProviderKind,
        code: Option<String>,
        message: String,
    },

    #[error("Payment cancelled by customer at {provider}")]
    UserCancelled { provider: ProviderKind },

    #[error("Runtime is known to be incompatible with {provider}: {message}")]
    EnvironmentIncompatibility {
        provider: ProviderKind,
        message: String,
    },

    #[error("Notification dispatch failed for order {order_id}: {message}")]
    NotificationDispatchFailure { order_id: Uuid, message: String },

    #[error("Invalid transition: cannot {action} while {state}")]
    InvalidTransition {
        state: &'static str,
        action: &'static str,
    },

    #[error("Cart is empty or contains an invalid line")]
    EmptyCart,

    #[error("Intent {intent_id} has not succeeded (status {status})")]
    PrematureFinalization { intent_id: String, status: String },

    #[error("Recovery journal error: {0}")]
    Storage(#[from] StorageError),

    #[error("Checkout session {0} not found")]
    SessionNotFound(Uuid),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<validator::ValidationErrors> for CheckoutError {
    fn from(err: validator::ValidationErrors) -> Self {
        CheckoutError::Validation(err.into())
    }
}

impl CheckoutError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CheckoutError::Validation(ValidationFailure::single(field, message))
    }

    /// Only transient provider outages are retried, and only once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckoutError::ProviderUnavailable { .. })
    }

    /// Short machine-readable code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::DeclinedByProvider { .. } => "declined_by_provider",
            Self::UserCancelled { .. } => "user_cancelled",
            Self::EnvironmentIncompatibility { .. } => "environment_incompatibility",
            Self::NotificationDispatchFailure { .. } => "notification_dispatch_failure",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::EmptyCart => "empty_cart",
            Self::PrematureFinalization { .. } => "premature_finalization",
            Self::Storage(_) => "storage_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) | Self::EmptyCart => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::DeclinedByProvider { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::UserCancelled { .. } | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::PrematureFinalization { .. } => StatusCode::CONFLICT,
            Self::EnvironmentIncompatibility { .. } => StatusCode::PRECONDITION_FAILED,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::NotificationDispatchFailure { .. }
            | Self::Storage(_)
            | Self::Config(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::Storage(_) | Self::Config(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
    pub timestamp: String,
}

impl IntoResponse for CheckoutError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "checkout request failed");
        }
        let fields = match &self {
            CheckoutError::Validation(failure) => Some(failure.fields.clone()),
            _ => None,
        };
        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.response_message(),
            fields,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        (status, Json(body)).into_response()
    }
}
