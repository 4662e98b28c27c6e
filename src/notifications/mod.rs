//! Kitchen notification dispatch.
//!
//! Only the dispatch contract lives here; delivery and retries of pending
//! notifications belong to the receiving service.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{DeliveryDetails, LineItem, OrderRecord};

/// Payload posted for every newly finalized order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderNotification {
    pub order_id: Uuid,
    pub order_number: String,
    pub total: Decimal,
    pub currency: String,
    pub delivery_details: DeliveryDetails,
    pub items: Vec<LineItem>,
}

impl From<&OrderRecord> for OrderNotification {
    fn from(order: &OrderRecord) -> Self {
        Self {
            order_id: order.order_id,
            order_number: order.order_number.clone(),
            total: order.total,
            currency: order.currency.clone(),
            delivery_details: order.delivery_details.clone(),
            items: order.items.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Notification endpoint rejected order {order_id} with status {status}")]
    Rejected { order_id: Uuid, status: u16 },
    #[error("Internal error: {0}")]
    Internal(String),
}

#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, notification: &OrderNotification) -> Result<(), NotificationError>;
}

/// Posts notifications as JSON to a fixed endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotificationDispatcher {
    http: Client,
    url: String,
}

impl HttpNotificationDispatcher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationDispatcher for HttpNotificationDispatcher {
    #[instrument(skip(self, notification), fields(order_id = %notification.order_id))]
    async fn dispatch(&self, notification: &OrderNotification) -> Result<(), NotificationError> {
        let response = self.http.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected {
                order_id: notification.order_id,
                status: status.as_u16(),
            });
        }
        info!("order notification delivered");
        Ok(())
    }
}

/// Used when no endpoint is configured: the notification is only logged.
#[derive(Debug, Clone, Default)]
pub struct LogNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for LogNotificationDispatcher {
    async fn dispatch(&self, notification: &OrderNotification) -> Result<(), NotificationError> {
        info!(
            order_id = %notification.order_id,
            order_number = %notification.order_number,
            total = %notification.total,
            items = notification.items.len(),
            "new order (notification endpoint not configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, ProviderKind};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn payload_uses_camel_case() {
        let order_id = OrderRecord::order_id_for("pi_1");
        let order = OrderRecord {
            order_id,
            order_number: OrderRecord::order_number_for(order_id),
            intent_id: "pi_1".into(),
            finalized_at: Utc::now(),
            subtotal: dec!(8.99),
            fee: dec!(0),
            total: dec!(8.99),
            currency: "GBP".into(),
            delivery_details: DeliveryDetails::pickup("Ada Obi", "ada@example.com", "07700900123"),
            items: vec![LineItem::new("jollof", "Jollof Rice", dec!(8.99), 1)],
            provider_kind: ProviderKind::Card,
            status: OrderStatus::Completed,
            notification_pending: true,
        };
        let json = serde_json::to_value(OrderNotification::from(&order)).unwrap();
        assert_eq!(json["orderId"], order_id.to_string());
        assert!(json.get("orderNumber").is_some());
        assert!(json.get("deliveryDetails").is_some());
        assert!(json.get("intent_id").is_none());
    }
}
