use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DeliveryDetails, LineItem, ProviderKind};

/// Namespace for deriving order ids from provider intent ids.
pub const ORDER_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d1a_a8e2_5c0f_7b3d_9e41);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Completed,
}

/// A durably recorded order. Exactly one exists per intent id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: Uuid,
    pub order_number: String,
    pub intent_id: String,
    pub finalized_at: DateTime<Utc>,
    pub subtotal: Decimal,
    pub fee: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub delivery_details: DeliveryDetails,
    pub items: Vec<LineItem>,
    pub provider_kind: ProviderKind,
    pub status: OrderStatus,
    /// Set when the kitchen notification could not be delivered yet.
    #[serde(default)]
    pub notification_pending: bool,
}

impl OrderRecord {
    /// Order ids are derived from the intent id and never regenerated.
    pub fn order_id_for(intent_id: &str) -> Uuid {
        Uuid::new_v5(&ORDER_NAMESPACE, intent_id.as_bytes())
    }

    pub fn order_number_for(order_id: Uuid) -> String {
        format!("ORD-{}", order_id.simple().to_string()[..8].to_uppercase())
    }
}
