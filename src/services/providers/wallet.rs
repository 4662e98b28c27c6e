use async_trait::async_trait;
use std::sync::Arc;

use super::client::{CheckoutAttempt, CustomerRef, ProviderClient};
use super::{AdapterCore, PaymentProviderAdapter, StatusTable};
use crate::errors::CheckoutError;
use crate::models::{IntentStatus, PaymentDetails, PaymentIntent, ProviderKind};

const WALLET_STATUSES: StatusTable = &[
    ("created", IntentStatus::Created),
    ("payer_action_required", IntentStatus::AwaitingConfirmation),
    ("approved", IntentStatus::AwaitingConfirmation),
    ("completed", IntentStatus::Captured),
    ("declined", IntentStatus::Failed),
    ("voided", IntentStatus::Cancelled),
];

/// Redirect wallet. Confirm returns an approval link the customer is sent
/// to; capture runs after they come back.
pub struct WalletAdapter {
    core: AdapterCore,
}

impl WalletAdapter {
    pub fn new(client: Arc<dyn ProviderClient>) -> Self {
        Self {
            core: AdapterCore::new(ProviderKind::RedirectWallet, client, WALLET_STATUSES),
        }
    }
}

#[async_trait]
impl PaymentProviderAdapter for WalletAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::RedirectWallet
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
        details.check_for(ProviderKind::RedirectWallet)?;
        let confirmed = self.core.confirm(intent, details, attempt).await?;
        if confirmed.status == IntentStatus::AwaitingConfirmation && confirmed.redirect_url.is_none()
        {
            return Err(CheckoutError::ProviderUnavailable {
                provider: ProviderKind::RedirectWallet,
                message: "approval link missing from confirm response".into(),
            });
        }
        Ok(confirmed)
    }

    async fn capture(&self, intent: &PaymentIntent) -> Result<PaymentIntent, CheckoutError> {
        match intent.status {
            IntentStatus::Captured => Ok(intent.clone()),
            IntentStatus::Created => Err(CheckoutError::InvalidTransition {
                state: "created",
                action: "capture",
            }),
            _ => self.core.capture(intent).await,
        }
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
    use crate::services::providers::{SandboxOutcome, SandboxProviderClient};

    fn customer() -> CustomerRef {
        CustomerRef {
            full_name: "Ada Obi".into(),
            email: "ada@example.com".into(),
            phone: "+44 7700 900123".into(),
        }
    }

    fn attempt() -> CheckoutAttempt {
        CheckoutAttempt {
            idempotency_key: "attempt-w".into(),
            return_url: "http://localhost/complete".into(),
        }
    }

    async fn confirmed(adapter: &WalletAdapter) -> PaymentIntent {
        let intent = adapter
            .create_intent(2548, "GBP", &customer(), &attempt())
            .await
            .unwrap();
        adapter
            .confirm(&intent, &PaymentDetails::Wallet, &attempt())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn confirm_awaits_customer_then_capture_completes() {
        let adapter = WalletAdapter::new(Arc::new(SandboxProviderClient::new(
            ProviderKind::RedirectWallet,
        )));
        let intent = confirmed(&adapter).await;
        assert_eq!(intent.status, IntentStatus::AwaitingConfirmation);
        assert!(intent.redirect_url.is_some());
        assert!(!intent.is_session_success());

        let captured = adapter.capture(&intent).await.unwrap();
        assert_eq!(captured.status, IntentStatus::Captured);
    }

    #[tokio::test]
    async fn customer_cancelling_at_wallet() {
        let sandbox = Arc::new(SandboxProviderClient::new(ProviderKind::RedirectWallet));
        sandbox.script(SandboxOutcome::UserCancels);
        let adapter = WalletAdapter::new(sandbox);
        let intent = confirmed(&adapter).await;
        assert!(matches!(
            adapter.capture(&intent).await,
            Err(CheckoutError::UserCancelled {
                provider: ProviderKind::RedirectWallet
            })
        ));
    }

    #[tokio::test]
    async fn capture_before_confirm_is_rejected() {
        let adapter = WalletAdapter::new(Arc::new(SandboxProviderClient::new(
            ProviderKind::RedirectWallet,
        )));
        let intent = adapter
            .create_intent(2548, "GBP", &customer(), &attempt())
            .await
            .unwrap();
        assert!(matches!(
            adapter.capture(&intent).await,
            Err(CheckoutError::InvalidTransition { .. })
        ));
    }
}
