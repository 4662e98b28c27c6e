use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CompletionStrategy, ProviderKind};

/// Domain events emitted while driving a checkout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckoutEvent {
    CheckoutStarted {
        session_id: Uuid,
        item_count: u64,
        subtotal: Decimal,
    },
    DetailsSubmitted {
        session_id: Uuid,
    },
    ProviderSelected {
        session_id: Uuid,
        provider: ProviderKind,
        strategy: CompletionStrategy,
    },
    PaymentStarted {
        session_id: Uuid,
        intent_id: String,
        provider: ProviderKind,
    },
    PaymentCancelled {
        session_id: Uuid,
        provider: ProviderKind,
    },
    PaymentFailed {
        session_id: Uuid,
        provider: ProviderKind,
        reason: String,
    },
    CheckoutAbandoned {
        session_id: Uuid,
    },
    OrderFinalized {
        order_id: Uuid,
        order_number: String,
        intent_id: String,
        total: Decimal,
        notification_pending: bool,
        at: DateTime<Utc>,
    },
}

impl CheckoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CheckoutEvent::CheckoutStarted { .. } => "checkout_started",
            CheckoutEvent::DetailsSubmitted { .. } => "details_submitted",
            CheckoutEvent::ProviderSelected { .. } => "provider_selected",
            CheckoutEvent::PaymentStarted { .. } => "payment_started",
            CheckoutEvent::PaymentCancelled { .. } => "payment_cancelled",
            CheckoutEvent::PaymentFailed { .. } => "payment_failed",
            CheckoutEvent::CheckoutAbandoned { .. } => "checkout_abandoned",
            CheckoutEvent::OrderFinalized { .. } => "order_finalized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<CheckoutEvent>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<CheckoutEvent>) -> Self {
        Self { sender }
    }

    /// Channel pair with the given buffer size.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<CheckoutEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self::new(tx), rx)
    }

    pub async fn send(&self, event: CheckoutEvent) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Events are advisory; a closed channel never fails the checkout.
    pub async fn send_or_log(&self, event: CheckoutEvent) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping checkout event");
        }
    }
}

/// Drains the channel, logging each event.
pub async fn process_events(mut rx: mpsc::Receiver<CheckoutEvent>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            CheckoutEvent::OrderFinalized {
                order_id,
                order_number,
                notification_pending,
                ..
            } => info!(
                event = event.name(),
                %order_id,
                %order_number,
                notification_pending,
                "order finalized"
            ),
            CheckoutEvent::PaymentFailed {
                session_id,
                provider,
                reason,
            } => warn!(
                event = event.name(),
                %session_id,
                %provider,
                %reason,
                "payment failed"
            ),
            other => info!(event = other.name(), payload = ?other, "checkout event"),
        }
    }

    info!("Event channel closed, stopping event processing");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_in_order() {
        let (sender, mut rx) = EventSender::channel(4);
        let session_id = Uuid::new_v4();
        sender
            .send(CheckoutEvent::DetailsSubmitted { session_id })
            .await
            .unwrap();
        sender
            .send_or_log(CheckoutEvent::CheckoutAbandoned { session_id })
            .await;
        assert_eq!(
            rx.recv().await.unwrap(),
            CheckoutEvent::DetailsSubmitted { session_id }
        );
        assert_eq!(rx.recv().await.unwrap().name(), "checkout_abandoned");
    }

    #[tokio::test]
    async fn closed_channel_is_not_fatal() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        assert!(sender
            .send(CheckoutEvent::CheckoutAbandoned {
                session_id: Uuid::nil()
            })
            .await
            .is_err());
        sender
            .send_or_log(CheckoutEvent::CheckoutAbandoned {
                session_id: Uuid::nil(),
            })
            .await;
    }
}
