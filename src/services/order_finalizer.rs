use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

use crate::errors::CheckoutError;
use crate::events::{CheckoutEvent, EventSender};
use crate::models::{Cart, DeliveryDetails, OrderRecord, OrderStatus, PaymentIntent};
use crate::notifications::{NotificationDispatcher, OrderNotification};
use crate::services::pricing::{to_minor_units, PricingService};
use crate::services::recovery_store::RecoveryStore;

/// Records each successful payment as exactly one order.
///
/// Safe to call from any number of paths for the same intent: the in-process
/// return, the completion page, a reload or a duplicate tab. Calls for one
/// intent are serialized; the first records the order and notifies the
/// kitchen, the rest return the recorded order.
pub struct OrderFinalizer {
    recovery: Arc<RecoveryStore>,
    notifier: Arc<dyn NotificationDispatcher>,
    pricing: PricingService,
    notification_timeout: Duration,
    memo_capacity: usize,
    events: Option<EventSender>,
    intent_locks: Arc<AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    memo: DashMap<String, OrderRecord>,
}

impl OrderFinalizer {
    pub fn new(
        recovery: Arc<RecoveryStore>,
        notifier: Arc<dyn NotificationDispatcher>,
        pricing: PricingService,
        notification_timeout: Duration,
    ) -> Self {
        Self {
            recovery,
            notifier,
            pricing,
            notification_timeout,
            memo_capacity: 256,
            events: None,
            intent_locks: Arc::new(AsyncMutex::new(HashMap::new())),
            memo: DashMap::new(),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_memo_capacity(mut self, capacity: usize) -> Self {
        self.memo_capacity = capacity.max(1);
        self
    }

    #[instrument(skip_all, fields(intent_id = %intent.intent_id, provider = %intent.provider_kind))]
    pub async fn finalize(
        &self,
        intent: &PaymentIntent,
        details: &DeliveryDetails,
        cart: &Cart,
    ) -> Result<OrderRecord, CheckoutError> {
        if !intent.is_session_success() {
            return Err(CheckoutError::PrematureFinalization {
                intent_id: intent.intent_id.clone(),
                status: intent.status.to_string(),
            });
        }
        if let Some(order) = self.memo.get(&intent.intent_id) {
            return Ok(order.clone());
        }

        let lock = self.acquire_intent_lock(&intent.intent_id).await;
        let guard = lock.lock().await;
        let result = self.finalize_locked(intent, details, cart).await;
        drop(guard);
        self.release_intent_lock(&intent.intent_id, lock).await;
        result
    }

    /// The order already recorded for `intent_id`, without finalizing.
    pub async fn existing(&self, intent_id: &str) -> Result<Option<OrderRecord>, CheckoutError> {
        if let Some(order) = self.memo.get(intent_id) {
            return Ok(Some(order.clone()));
        }
        Ok(self.recovery.finalized_order(intent_id).await?)
    }

    async fn finalize_locked(
        &self,
        intent: &PaymentIntent,
        details: &DeliveryDetails,
        cart: &Cart,
    ) -> Result<OrderRecord, CheckoutError> {
        if let Some(order) = self.memo.get(&intent.intent_id) {
            return Ok(order.clone());
        }
        if let Some(order) = self.recovery.finalized_order(&intent.intent_id).await? {
            debug!("intent already finalized in journal");
            self.remember(order.clone());
            return Ok(order);
        }

        let quote = self.pricing.quote(cart, details.fulfillment_mode);
        if to_minor_units(quote.total).ok() != Some(intent.amount_minor_units) {
            warn!(
                quoted = %quote.total,
                charged_minor_units = intent.amount_minor_units,
                "charged amount differs from quoted total"
            );
        }

        let order_id = OrderRecord::order_id_for(&intent.intent_id);
        let mut order = OrderRecord {
            order_id,
            order_number: OrderRecord::order_number_for(order_id),
            intent_id: intent.intent_id.clone(),
            finalized_at: Utc::now(),
            subtotal: quote.subtotal,
            fee: quote.fee,
            total: quote.total,
            currency: intent.currency.clone(),
            delivery_details: details.clone(),
            items: cart.items.clone(),
            provider_kind: intent.provider_kind,
            status: OrderStatus::Completed,
            notification_pending: true,
        };

        if !self.recovery.mark_finalized(&order).await? {
            if let Some(existing) = self.recovery.finalized_order(&intent.intent_id).await? {
                self.remember(existing.clone());
                return Ok(existing);
            }
        }

        self.notify(&mut order).await;

        match self.recovery.clear_intent(&intent.intent_id).await {
            Ok(cleared) => debug!(cleared, "cleared in-flight journal entries"),
            Err(e) => warn!(error = %e, "failed to clear journal entries after finalize"),
        }

        info!(
            order_id = %order.order_id,
            order_number = %order.order_number,
            total = %order.total,
            notification_pending = order.notification_pending,
            "order finalized"
        );
        self.remember(order.clone());
        if let Some(events) = &self.events {
            events
                .send_or_log(CheckoutEvent::OrderFinalized {
                    order_id: order.order_id,
                    order_number: order.order_number.clone(),
                    intent_id: order.intent_id.clone(),
                    total: order.total,
                    notification_pending: order.notification_pending,
                    at: order.finalized_at,
                })
                .await;
        }
        Ok(order)
    }

    /// Dispatches the kitchen notification. A failure leaves the order
    /// recorded with `notification_pending` set.
    async fn notify(&self, order: &mut OrderRecord) {
        let payload = OrderNotification::from(&*order);
        let failure = match tokio::time::timeout(
            self.notification_timeout,
            self.notifier.dispatch(&payload),
        )
        .await
        {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no response within {}ms",
                self.notification_timeout.as_millis()
            )),
        };

        match failure {
            None => {
                order.notification_pending = false;
                if let Err(e) = self.recovery.update_order(order).await {
                    warn!(error = %e, "failed to clear notification_pending flag");
                }
            }
            Some(message) => {
                let err = CheckoutError::NotificationDispatchFailure {
                    order_id: order.order_id,
                    message,
                };
                warn!(error = %err, "order recorded with notification pending");
            }
        }
    }

    fn remember(&self, order: OrderRecord) {
        if self.memo.len() >= self.memo_capacity {
            let oldest = self
                .memo
                .iter()
                .min_by_key(|entry| entry.value().finalized_at)
                .map(|entry| entry.key().clone());
            if let Some(key) = oldest {
                self.memo.remove(&key);
            }
        }
        self.memo.insert(order.intent_id.clone(), order);
    }

    async fn acquire_intent_lock(&self, intent_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.intent_locks.lock().await;
        locks
            .entry(intent_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    async fn release_intent_lock(&self, intent_id: &str, lock: Arc<AsyncMutex<()>>) {
        let mut locks = self.intent_locks.lock().await;
        // one reference in the map, one held here
        if Arc::strong_count(&lock) <= 2 {
            if let Some(existing) = locks.get(intent_id) {
                if Arc::ptr_eq(existing, &lock) {
                    locks.remove(intent_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IntentStatus, JournalStage, LineItem, ProviderKind, RecoveryRecord};
    use crate::notifications::NotificationError;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct CountingNotifier {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl NotificationDispatcher for CountingNotifier {
        async fn dispatch(&self, _: &OrderNotification) -> Result<(), NotificationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotificationError::Internal("kitchen offline".into()))
            } else {
                Ok(())
            }
        }
    }

    fn cart() -> Cart {
        Cart::new(vec![
            LineItem::new("jollof", "Jollof Rice", dec!(8.99), 2),
            LineItem::new("plantain", "Fried Plantain", dec!(4.00), 1),
        ])
    }

    fn details() -> DeliveryDetails {
        DeliveryDetails::pickup("Ada Obi", "ada@example.com", "07700900123")
    }

    fn captured(id: &str) -> PaymentIntent {
        PaymentIntent::new(id, ProviderKind::Card, 2198, "GBP")
            .with_status(IntentStatus::Captured)
            .unwrap()
    }

    fn finalizer(notifier: Arc<CountingNotifier>) -> (OrderFinalizer, Arc<RecoveryStore>) {
        let recovery = Arc::new(RecoveryStore::new(
            Arc::new(InMemoryStorage::new()),
            "test",
            50,
        ));
        let finalizer = OrderFinalizer::new(
            recovery.clone(),
            notifier,
            PricingService::new(dec!(3.50)),
            Duration::from_secs(1),
        );
        (finalizer, recovery)
    }

    #[tokio::test]
    async fn second_finalize_returns_same_order_without_notifying() {
        let notifier = Arc::new(CountingNotifier::default());
        let (finalizer, _) = finalizer(notifier.clone());
        let intent = captured("pi_1");

        let first = finalizer.finalize(&intent, &details(), &cart()).await.unwrap();
        let second = finalizer.finalize(&intent, &details(), &cart()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.total, dec!(21.98));
        assert!(!first.notification_pending);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_finalize_records_one_order() {
        let notifier = Arc::new(CountingNotifier::default());
        let (finalizer, _) = finalizer(notifier.clone());
        let finalizer = Arc::new(finalizer);
        let intent = captured("pi_race");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let finalizer = finalizer.clone();
                let intent = intent.clone();
                tokio::spawn(async move { finalizer.finalize(&intent, &details(), &cart()).await })
            })
            .collect();
        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().order_id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn premature_intents_are_rejected() {
        let (finalizer, _) = finalizer(Arc::new(CountingNotifier::default()));
        let created = PaymentIntent::new("pi_2", ProviderKind::Card, 2198, "GBP");
        let failed = created.clone().with_status(IntentStatus::Failed).unwrap();
        let wallet_pending = PaymentIntent::new("wl_1", ProviderKind::RedirectWallet, 2198, "GBP")
            .with_status(IntentStatus::AwaitingConfirmation)
            .unwrap();

        for intent in [created, failed, wallet_pending] {
            assert!(matches!(
                finalizer.finalize(&intent, &details(), &cart()).await,
                Err(CheckoutError::PrematureFinalization { .. })
            ));
        }
    }

    #[tokio::test]
    async fn notification_failure_keeps_the_order() {
        let notifier = Arc::new(CountingNotifier {
            fail: true,
            ..Default::default()
        });
        let (finalizer, recovery) = finalizer(notifier);
        let order = finalizer
            .finalize(&captured("pi_3"), &details(), &cart())
            .await
            .unwrap();
        assert!(order.notification_pending);
        let stored = recovery.order_by_id(order.order_id).await.unwrap().unwrap();
        assert!(stored.notification_pending);
    }

    #[tokio::test]
    async fn finalize_clears_in_flight_journal_entry() {
        let (finalizer, recovery) = finalizer(Arc::new(CountingNotifier::default()));
        let intent = captured("pi_4");
        let mut record =
            RecoveryRecord::new(Uuid::new_v4(), JournalStage::AwaitingCompletion, cart());
        record.payment_intent = Some(intent.clone());
        recovery.write_intent(&record).await.unwrap();

        finalizer.finalize(&intent, &details(), &cart()).await.unwrap();
        assert!(recovery.read_latest(Some(record.session_id)).await.is_none());
    }

    #[tokio::test]
    async fn restarted_finalizer_finds_journaled_order() {
        let notifier = Arc::new(CountingNotifier::default());
        let recovery = Arc::new(RecoveryStore::new(
            Arc::new(InMemoryStorage::new()),
            "test",
            50,
        ));
        let build = || {
            OrderFinalizer::new(
                recovery.clone(),
                notifier.clone(),
                PricingService::new(dec!(3.50)),
                Duration::from_secs(1),
            )
        };
        let intent = captured("pi_5");
        let first = build().finalize(&intent, &details(), &cart()).await.unwrap();
        let second = build().finalize(&intent, &details(), &cart()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }
}
