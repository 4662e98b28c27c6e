use async_trait::async_trait;
use std::sync::Arc;

use super::client::{CheckoutAttempt, CustomerRef, ProviderClient};
use super::{AdapterCore, PaymentProviderAdapter, StatusTable};
use crate::errors::CheckoutError;
use crate::models::{IntentStatus, PaymentDetails, PaymentIntent, ProviderKind};

const CARD_STATUSES: StatusTable = &[
    ("requires_confirmation", IntentStatus::Created),
    ("requires_payment_method", IntentStatus::Failed),
    ("requires_action", IntentStatus::AwaitingConfirmation),
    ("processing", IntentStatus::AwaitingConfirmation),
    ("succeeded", IntentStatus::Captured),
    ("failed", IntentStatus::Failed),
    ("canceled", IntentStatus::Cancelled),
];

/// Card gateway. Confirmation authorizes and captures in one call.
pub struct CardAdapter {
    core: AdapterCore,
}

impl CardAdapter {
    pub fn new(client: Arc<dyn ProviderClient>) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::Card, client, CARD_STATUSES),
        }
    }
}

#[async_trait]
impl PaymentProviderAdapter for CardAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Card
    }

    async fn create_intent(
        &self,
        amount_minor_units: i64,
        currency: &str,
        customer: &CustomerRef,
        attempt: &CheckoutAttempt,
    ) -> Result<PaymentIntent, CheckoutError> {
        self.core
            .create(amount_minor_units, currency, customer, attempt)
            .await
    }

    async fn confirm(
        &self,
        intent: &PaymentIntent,
        details: &PaymentDetails,
        attempt: &CheckoutAttempt,
    ) -> Result<PaymentIntent, CheckoutError> {
        details.check_for(ProviderKind::Card)?;
        self.core.confirm(intent, details, attempt).await
    }

    /// Already captured by confirm; only re-reads anything still processing.
    async fn capture(&self, intent: &PaymentIntent) -> Result<PaymentIntent, CheckoutError> {
        if intent.status == IntentStatus::Captured {
            return Ok(intent.clone());
        }
        self.core.refresh(intent).await
    }

    async fn cancel(&self, intent: &PaymentIntent) {
        self.core.cancel(intent).await
    }

    async fn refresh(&self, intent: &PaymentIntent) -> Result<PaymentIntent, CheckoutError> {
        self.core.refresh(intent).await
    }
}
