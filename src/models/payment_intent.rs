use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::errors::CheckoutError;

/// The three payment backends the storefront supports.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    /// Card-network gateway; confirm captures in one step.
    Card,
    /// Wallet gateway that leaves the page and returns; authorize then capture.
    RedirectWallet,
    /// Bank debit; settlement happens out of band days later.
    BankDebit,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Card,
        ProviderKind::RedirectWallet,
        ProviderKind::BankDebit,
    ];

    /// Whether confirmation navigates the customer away from the storefront.
    pub fn redirects(self) -> bool {
        matches!(self, ProviderKind::RedirectWallet)
    }

    /// Whether `AwaitingConfirmation` already counts as a checkout success.
    pub fn settles_out_of_band(self) -> bool {
        matches!(self, ProviderKind::BankDebit)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntentStatus {
    Created,
    AwaitingConfirmation,
    Captured,
    Failed,
    Cancelled,
}

impl IntentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            IntentStatus::Captured | IntentStatus::Failed | IntentStatus::Cancelled
        )
    }

    fn can_become(self, next: IntentStatus) -> bool {
        use IntentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Created, AwaitingConfirmation | Captured | Failed | Cancelled) => true,
            (AwaitingConfirmation, Captured | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

/// A provider-tracked attempt to charge the customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub provider_kind: ProviderKind,
    pub amount_minor_units: i64,
    pub currency: String,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    /// Never journaled.
    #[serde(skip)]
    pub client_secret: Option<String>,
}

impl PaymentIntent {
    pub fn new(
        intent_id: impl Into<String>,
        provider_kind: ProviderKind,
        amount_minor_units: i64,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            intent_id: intent_id.into(),
            provider_kind,
            amount_minor_units,
            currency: currency.into(),
            status: IntentStatus::Created,
            created_at: Utc::now(),
            redirect_url: None,
            client_secret: None,
        }
    }

    /// Moves the intent forward. Terminal intents never change; repeating the
    /// current status is accepted as a no-op.
    pub fn transition(&mut self, next: IntentStatus) -> Result<(), CheckoutError> {
        if !self.status.can_become(next) {
            return Err(CheckoutError::Internal(format!(
                "intent {} cannot move from {} to {}",
                self.intent_id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn with_status(mut self, next: IntentStatus) -> Result<Self, CheckoutError> {
        self.transition(next)?;
        Ok(self)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Captured, or pending settlement for providers that settle out of band.
    pub fn is_session_success(&self) -> bool {
        match self.status {
            IntentStatus::Captured => true,
            IntentStatus::AwaitingConfirmation => self.provider_kind.settles_out_of_band(),
            _ => false,
        }
    }
}

/// Method-specific details collected at payment time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentDetails {
    Card {
        token: String,
    },
    Wallet,
    BankDebit {
        account_holder: String,
        sort_code: String,
        account_number: String,
    },
}

impl PaymentDetails {
    pub fn kind(&self) -> ProviderKind {
        match self {
            PaymentDetails::Card { .. } => ProviderKind::Card,
            PaymentDetails::Wallet => ProviderKind::RedirectWallet,
            PaymentDetails::BankDebit { .. } => ProviderKind::BankDebit,
        }
    }

    /// Checks the details match the selected provider and are well formed.
    pub fn check_for(&self, provider: ProviderKind) -> Result<(), CheckoutError> {
        if self.kind() != provider {
            return Err(CheckoutError::validation(
                "payment_details",
                format!("Details for {} cannot be used with {}", self.kind(), provider),
            ));
        }
        match self {
            PaymentDetails::Card { token } if token.trim().is_empty() => Err(
                CheckoutError::validation("token", "Card token is required"),
            ),
            PaymentDetails::BankDebit {
                account_holder,
                sort_code,
                account_number,
            } => {
                let mut failure = crate::errors::ValidationFailure::default();
                if account_holder.trim().is_empty() {
                    failure.push("account_holder", "Account holder is required");
                }
                let sort_digits: String =
                    sort_code.chars().filter(|c| *c != '-' && *c != ' ').collect();
                if sort_digits.len() != 6 || !sort_digits.chars().all(|c| c.is_ascii_digit()) {
                    failure.push("sort_code", "Sort code must be 6 digits");
                }
                if account_number.len() != 8 || !account_number.chars().all(|c| c.is_ascii_digit())
                {
                    failure.push("account_number", "Account number must be 8 digits");
                }
                if failure.is_empty() {
                    Ok(())
                } else {
                    Err(CheckoutError::Validation(failure))
                }
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_intents_do_not_move() {
        let mut intent = PaymentIntent::new("pi_1", ProviderKind::Card, 2198, "GBP");
        intent.transition(IntentStatus::Captured).unwrap();
        assert!(intent.transition(IntentStatus::Failed).is_err());
        // repeating the same status is fine
        assert!(intent.transition(IntentStatus::Captured).is_ok());
    }

    #[test]
    fn awaiting_confirmation_is_success_only_for_bank_debit() {
        let bank = PaymentIntent::new("bd_1", ProviderKind::BankDebit, 100, "GBP")
            .with_status(IntentStatus::AwaitingConfirmation)
            .unwrap();
        let wallet = PaymentIntent::new("wl_1", ProviderKind::RedirectWallet, 100, "GBP")
            .with_status(IntentStatus::AwaitingConfirmation)
            .unwrap();
        assert!(bank.is_session_success());
        assert!(!wallet.is_session_success());
    }

    #[test]
    fn created_is_never_success() {
        let card = PaymentIntent::new("pi_2", ProviderKind::Card, 100, "GBP");
        assert!(!card.is_session_success());
    }

    #[test]
    fn client_secret_is_not_serialized() {
        let mut intent = PaymentIntent::new("pi_3", ProviderKind::Card, 100, "GBP");
        intent.client_secret = Some("pi_3_secret".into());
        let json = serde_json::to_string(&intent).unwrap();
        assert!(!json.contains("pi_3_secret"));
    }

    #[test]
    fn payment_details_must_match_provider() {
        let details = PaymentDetails::Wallet;
        assert!(details.check_for(ProviderKind::Card).is_err());
        assert!(details.check_for(ProviderKind::RedirectWallet).is_ok());
    }

    #[test]
    fn bank_details_are_format_checked() {
        let details = PaymentDetails::BankDebit {
            account_holder: "Ada Obi".into(),
            sort_code: "20-00-00".into(),
            account_number: "5566".into(),
        };
        match details.check_for(ProviderKind::BankDebit) {
            Err(CheckoutError::Validation(failure)) => {
                assert!(failure.has_field("account_number"));
                assert!(!failure.has_field("sort_code"));
            }
            other => panic!("expected validation failure, got {:?}", other),
        }
    }
}
