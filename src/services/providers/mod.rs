//! Payment provider adapters.
//!
//! Each backend has its own status vocabulary and error shapes. Adapters
//! translate both into [`IntentStatus`] and the provider variants of
//! [`CheckoutError`] before anything reaches the checkout session.

pub mod bank_debit;
pub mod card;
pub mod client;
pub mod http;
pub mod sandbox;
pub mod wallet;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub use bank_debit::BankDebitAdapter;
pub use card::CardAdapter;
pub use client::{CheckoutAttempt, CustomerRef, ProviderClient, ProviderClientError};
pub use http::HttpProviderClient;
pub use sandbox::{SandboxOutcome, SandboxProviderClient};
pub use wallet::WalletAdapter;

use crate::errors::CheckoutError;
use crate::models::{IntentStatus, PaymentDetails, PaymentIntent, ProviderKind};
use client::{ConfirmIntentRequest, CreateIntentRequest, IntentResponse};

/// Uniform operations over one payment backend.
#[async_trait]
pub trait PaymentProviderAdapter: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn redirects(&self) -> bool {
        self.kind().redirects()
    }

    async fn create_intent(
        &self,
        amount_minor_units: i64,
        currency: &str,
        customer: &CustomerRef,
        attempt: &CheckoutAttempt,
    ) -> Result<PaymentIntent, CheckoutError>;

    async fn confirm(
        &self,
        intent: &PaymentIntent,
        details: &PaymentDetails,
        attempt: &CheckoutAttempt,
    ) -> Result<PaymentIntent, CheckoutError>;

    async fn capture(&self, intent: &PaymentIntent) -> Result<PaymentIntent, CheckoutError>;

    /// Best effort. Failures are logged, never surfaced.
    async fn cancel(&self, intent: &PaymentIntent);

    /// Re-reads the intent from the provider.
    async fn refresh(&self, intent: &PaymentIntent) -> Result<PaymentIntent, CheckoutError>;
}

/// Maps a provider's raw status strings onto [`IntentStatus`].
pub type StatusTable = &'static [(&'static str, IntentStatus)];

/// Plumbing shared by all adapters: one client, one status table.
#[derive(Clone)]
pub(crate) struct AdapterCore {
    kind: ProviderKind,
    client: Arc<dyn ProviderClient>,
    statuses: StatusTable,
}

impl AdapterCore {
    pub(crate) fn new(
        kind: ProviderKind,
        client: Arc<dyn ProviderClient>,
        statuses: StatusTable,
    ) -> Self {
        Self {
            kind,
            client,
            statuses,
        }
    }

    pub(crate) fn normalize_status(&self, raw: &str) -> Result<IntentStatus, CheckoutError> {
        self.statuses
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(raw))
            .map(|(_, status)| *status)
            .ok_or_else(|| CheckoutError::ProviderUnavailable {
                provider: self.kind,
                message: format!("unrecognized status '{}'", raw),
            })
    }

    pub(crate) fn normalize_error(&self, err: ProviderClientError) -> CheckoutError {
        match err {
            ProviderClientError::Declined { code, message } => CheckoutError::DeclinedByProvider {
                provider: self.kind,
                code,
                message,
            },
            ProviderClientError::Cancelled => CheckoutError::UserCancelled {
                provider: self.kind,
            },
            other => CheckoutError::ProviderUnavailable {
                provider: self.kind,
                message: other.to_string(),
            },
        }
    }

    /// Folds a provider response into the local intent.
    ///
    /// A failed or cancelled outcome is returned as the matching error. A
    /// status that would move a terminal intent, or move an intent backwards,
    /// is treated as stale and the local intent is kept.
    pub(crate) fn apply(
        &self,
        intent: &PaymentIntent,
        response: IntentResponse,
    ) -> Result<PaymentIntent, CheckoutError> {
        if response.intent_id != intent.intent_id {
            return Err(CheckoutError::ProviderUnavailable {
                provider: self.kind,
                message: format!(
                    "response for {} while handling {}",
                    response.intent_id, intent.intent_id
                ),
            });
        }

        let status = self.normalize_status(&response.status)?;
        match status {
            IntentStatus::Failed => {
                return Err(CheckoutError::DeclinedByProvider {
                    provider: self.kind,
                    code: response.decline_code,
                    message: response
                        .message
                        .unwrap_or_else(|| "payment was not completed".into()),
                })
            }
            IntentStatus::Cancelled => {
                return Err(CheckoutError::UserCancelled {
                    provider: self.kind,
                })
            }
            _ => {}
        }

        let mut next = intent.clone();
        if next.transition(status).is_err() {
            debug!(
                intent_id = %intent.intent_id,
                local = %intent.status,
                remote = %status,
                "ignoring stale provider status"
            );
            return Ok(next);
        }
        if response.redirect_url.is_some() {
            next.redirect_url = response.redirect_url;
        }
        if response.client_secret.is_some() {
            next.client_secret = response.client_secret;
        }
        Ok(next)
    }

    pub(crate) async fn create(
        &self,
        amount_minor_units: i64,
        currency: &str,
        customer: &CustomerRef,
        attempt: &CheckoutAttempt,
    ) -> Result<PaymentIntent, CheckoutError> {
        let request = CreateIntentRequest {
            amount_minor_units,
            currency: currency.to_string(),
            customer: customer.clone(),
            reference: attempt.idempotency_key.clone(),
            return_url: attempt.return_url.clone(),
        };
        let response = self
            .client
            .create_intent(request, &attempt.idempotency_key)
            .await
            .map_err(|e| self.normalize_error(e))?;

        let created = PaymentIntent::new(
            response.intent_id.clone(),
            self.kind,
            amount_minor_units,
            currency,
        );
        self.apply(&created, response)
    }

    pub(crate) async fn confirm(
        &self,
        intent: &PaymentIntent,
        details: &PaymentDetails,
        attempt: &CheckoutAttempt,
    ) -> Result<PaymentIntent, CheckoutError> {
        let request = ConfirmIntentRequest {
            payment_method: details.clone(),
            return_url: attempt.return_url.clone(),
        };
        let response = self
            .client
            .confirm_intent(&intent.intent_id, request)
            .await
            .map_err(|e| self.normalize_error(e))?;
        self.apply(intent, response)
    }

    pub(crate) async fn capture(
        &self,
        intent: &PaymentIntent,
    ) -> Result<PaymentIntent, CheckoutError> {
        let response = self
            .client
            .capture_intent(&intent.intent_id)
            .await
            .map_err(|e| self.normalize_error(e))?;
        self.apply(intent, response)
    }

    pub(crate) async fn cancel(&self, intent: &PaymentIntent) {
        if intent.is_terminal() {
            return;
        }
        if let Err(e) = self.client.cancel_intent(&intent.intent_id).await {
            warn!(
                provider = %self.kind,
                intent_id = %intent.intent_id,
                error = %e,
                "failed to cancel intent"
            );
        }
    }

    pub(crate) async fn refresh(
        &self,
        intent: &PaymentIntent,
    ) -> Result<PaymentIntent, CheckoutError> {
        let response = self
            .client
            .retrieve_intent(&intent.intent_id)
            .await
            .map_err(|e| self.normalize_error(e))?;
        self.apply(intent, response)
    }
}

/// Adapters keyed by the provider they serve.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn PaymentProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn PaymentProviderAdapter>) -> Self {
        self.adapters.insert(adapter.kind(), adapter);
        self
    }

    /// Registers the three standard adapters over the given clients.
    pub fn standard(
        card: Arc<dyn ProviderClient>,
        wallet: Arc<dyn ProviderClient>,
        bank_debit: Arc<dyn ProviderClient>,
    ) -> Self {
        Self::new()
            .register(Arc::new(CardAdapter::new(card)))
            .register(Arc::new(WalletAdapter::new(wallet)))
            .register(Arc::new(BankDebitAdapter::new(bank_debit)))
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn PaymentProviderAdapter>, CheckoutError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| CheckoutError::ProviderUnavailable {
                provider: kind,
                message: "provider is not configured".into(),
            })
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        ProviderKind::ALL
            .into_iter()
            .filter(|k| self.adapters.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.kinds())
            .finish()
    }
}
