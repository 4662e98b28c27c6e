use async_trait::async_trait;
use std::sync::Arc;

use super::client::{CheckoutAttempt, CustomerRef, ProviderClient};
use super::{AdapterCore, PaymentProviderAdapter, StatusTable};
use crate::errors::CheckoutError;
use crate::models::{IntentStatus, PaymentDetails, PaymentIntent, ProviderKind};

const BANK_DEBIT_STATUSES: StatusTable = &[
    ("created", IntentStatus::Created),
    ("pending_submission", IntentStatus::AwaitingConfirmation),
    ("submitted", IntentStatus::AwaitingConfirmation),
    ("confirmed", IntentStatus::Captured),
    ("paid_out", IntentStatus::Captured),
    ("failed", IntentStatus::Failed),
    ("cancelled", IntentStatus::Cancelled),
];

/// Bank debit. Settlement happens days later, so a submitted mandate is as
/// far as checkout ever gets.
pub struct BankDebitAdapter {
    core: AdapterCore,
}

impl BankDebitAdapter {
    pub fn new(client: Arc<dyn ProviderClient>) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::BankDebit, client, BANK_DEBIT_STATUSES),
        }
    }
}

#[async_trait]
impl PaymentProviderAdapter for BankDebitAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::BankDebit
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
        details.check_for(ProviderKind::BankDebit)?;
        self.core.confirm(intent, details, attempt).await
    }

    /// Nothing to capture; settlement is driven by the bank.
    async fn capture(&self, intent: &PaymentIntent) -> Result<PaymentIntent, CheckoutError> {
        if intent.is_session_success() {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::SandboxProviderClient;

    fn mandate() -> PaymentDetails {
        PaymentDetails::BankDebit {
            account_holder: "Ada Obi".into(),
            sort_code: "20-00-00".into(),
            account_number: "55779911".into(),
        }
    }

    #[tokio::test]
    async fn submitted_mandate_counts_as_success() {
        let sandbox = Arc::new(SandboxProviderClient::new(ProviderKind::BankDebit));
        let adapter = BankDebitAdapter::new(sandbox.clone());
        let attempt = CheckoutAttempt {
            idempotency_key: "attempt-b".into(),
            return_url: "http://localhost/complete".into(),
        };
        let customer = CustomerRef {
            full_name: "Ada Obi".into(),
            email: "ada@example.com".into(),
            phone: "+44 7700 900123".into(),
        };
        let intent = adapter
            .create_intent(2198, "GBP", &customer, &attempt)
            .await
            .unwrap();
        let confirmed = adapter.confirm(&intent, &mandate(), &attempt).await.unwrap();
        assert_eq!(confirmed.status, IntentStatus::AwaitingConfirmation);
        assert!(confirmed.is_session_success());

        // capture does not call out once the mandate is in
        let captured = adapter.capture(&confirmed).await.unwrap();
        assert_eq!(captured.status, IntentStatus::AwaitingConfirmation);
        assert_eq!(sandbox.calls("retrieve"), 0);

        sandbox.set_remote_status(&confirmed.intent_id, "paid_out");
        let settled = adapter.refresh(&confirmed).await.unwrap();
        assert_eq!(settled.status, IntentStatus::Captured);
    }
}
