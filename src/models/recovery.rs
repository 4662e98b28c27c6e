use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cart, DeliveryDetails, PaymentIntent, ProviderKind};

/// Session stage at the time a journal record was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStage {
    CollectingDetails,
    SelectingProvider,
    AwaitingCompletion,
}

/// Everything needed to rebuild a checkout after the page state is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub session_id: Uuid,
    pub stage: JournalStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_kind: Option<ProviderKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent: Option<PaymentIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_details: Option<DeliveryDetails>,
    pub cart: Cart,
    pub written_at: DateTime<Utc>,
}

impl RecoveryRecord {
    pub fn new(session_id: Uuid, stage: JournalStage, cart: Cart) -> Self {
        Self {
            session_id,
            stage,
            provider_kind: None,
            payment_intent: None,
            delivery_details: None,
            cart,
            written_at: Utc::now(),
        }
    }

    pub fn intent_id(&self) -> Option<&str> {
        self.payment_intent.as_ref().map(|i| i.intent_id.as_str())
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.written_at
    }
}
