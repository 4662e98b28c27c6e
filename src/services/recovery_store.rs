//! Durable checkout journal.
//!
//! One active record per session, a bounded index of recently finalized
//! intents, and the finalized orders themselves, all under one namespace:
//!
//! - `{ns}:active:{session_id}`
//! - `{ns}:finalized`
//! - `{ns}:order:{order_id}`
//!
//! Reads are tolerant: anything that cannot be parsed is treated as absent
//! and removed on a best-effort basis.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::{OrderRecord, RecoveryRecord};
use crate::storage::{StorageBackend, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct FinalizedEntry {
    intent_id: String,
    order_id: Uuid,
    finalized_at: DateTime<Utc>,
    /// Sessions whose journal entry was settled by this order.
    #[serde(default)]
    sessions: Vec<Uuid>,
}

/// What a purge pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub expired_records: usize,
    pub corrupt_records: usize,
    pub expired_orders: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.expired_records + self.corrupt_records + self.expired_orders
    }
}

pub struct RecoveryStore {
    backend: Arc<dyn StorageBackend>,
    namespace: String,
    finalized_capacity: usize,
    index_lock: Mutex<()>,
}

impl RecoveryStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        namespace: impl Into<String>,
        finalized_capacity: usize,
    ) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            finalized_capacity: finalized_capacity.max(1),
            index_lock: Mutex::new(()),
        }
    }

    fn active_prefix(&self) -> String {
        format!("{}:active:", self.namespace)
    }

    fn active_key(&self, session_id: Uuid) -> String {
        format!("{}{}", self.active_prefix(), session_id)
    }

    fn finalized_key(&self) -> String {
        format!("{}:finalized", self.namespace)
    }

    fn order_key(&self, order_id: Uuid) -> String {
        format!("{}:order:{}", self.namespace, order_id)
    }

    /// Journals the session's current state, replacing any earlier record.
    #[instrument(skip(self, record), fields(session_id = %record.session_id, stage = ?record.stage))]
    pub async fn write_intent(&self, record: &RecoveryRecord) -> Result<(), StorageError> {
        let json = serde_json::to_string(record)?;
        self.backend
            .set(&self.active_key(record.session_id), &json)
            .await?;
        debug!("journal record written");
        Ok(())
    }

    /// Latest record for `session_id`, or the newest record of any session.
    /// Never fails: unreadable storage and corrupt entries read as `None`.
    pub async fn read_latest(&self, session_id: Option<Uuid>) -> Option<RecoveryRecord> {
        match session_id {
            Some(id) => self.read_record(&self.active_key(id)).await,
            None => {
                let keys = match self.backend.keys(&self.active_prefix()).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(error = %e, "journal unreadable");
                        return None;
                    }
                };
                let mut latest: Option<RecoveryRecord> = None;
                for key in keys {
                    if let Some(record) = self.read_record(&key).await {
                        if latest
                            .as_ref()
                            .map_or(true, |l| record.written_at > l.written_at)
                        {
                            latest = Some(record);
                        }
                    }
                }
                latest
            }
        }
    }

    async fn read_record(&self, key: &str) -> Option<RecoveryRecord> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "journal entry unreadable");
                return None;
            }
        };
        match serde_json::from_str::<RecoveryRecord>(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "discarding corrupted journal entry");
                if let Err(e) = self.backend.delete(key).await {
                    debug!(key, error = %e, "failed to remove corrupted entry");
                }
                None
            }
        }
    }

    async fn load_index(&self) -> Result<Vec<FinalizedEntry>, StorageError> {
        let Some(raw) = self.backend.get(&self.finalized_key()).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(error = %e, "finalized index corrupted, starting empty");
            Vec::new()
        }))
    }

    async fn save_index(&self, index: &[FinalizedEntry]) -> Result<(), StorageError> {
        let json = serde_json::to_string(index)?;
        self.backend.set(&self.finalized_key(), &json).await
    }

    /// Records the order and adds its intent to the finalized index.
    /// Returns `false` when the intent was already finalized.
    #[instrument(skip(self, order), fields(intent_id = %order.intent_id, order_id = %order.order_id))]
    pub async fn mark_finalized(&self, order: &OrderRecord) -> Result<bool, StorageError> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        if index.iter().any(|e| e.intent_id == order.intent_id) {
            return Ok(false);
        }

        self.backend
            .set(&self.order_key(order.order_id), &serde_json::to_string(order)?)
            .await?;
        index.push(FinalizedEntry {
            intent_id: order.intent_id.clone(),
            order_id: order.order_id,
            finalized_at: order.finalized_at,
            sessions: Vec::new(),
        });
        index.sort_by_key(|e| e.finalized_at);

        let overflow = index.len().saturating_sub(self.finalized_capacity);
        let evicted: Vec<FinalizedEntry> = index.drain(..overflow).collect();
        self.save_index(&index).await?;
        for entry in evicted {
            debug!(intent_id = %entry.intent_id, "evicting finalized entry over capacity");
            self.delete_quietly(&self.order_key(entry.order_id)).await;
        }
        Ok(true)
    }

    /// The order recorded for `intent_id`, if it is still in the index.
    pub async fn finalized_order(&self, intent_id: &str) -> Result<Option<OrderRecord>, StorageError> {
        let index = self.load_index().await?;
        match index.iter().find(|e| e.intent_id == intent_id) {
            Some(entry) => self.order_by_id(entry.order_id).await,
            None => Ok(None),
        }
    }

    /// Associates a session with an already finalized intent, so a load that
    /// only knows the session still finds the order after its journal entry
    /// is gone. No-op for intents not in the index.
    pub async fn link_session(&self, session_id: Uuid, intent_id: &str) -> Result<(), StorageError> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let Some(entry) = index.iter_mut().find(|e| e.intent_id == intent_id) else {
            return Ok(());
        };
        if entry.sessions.contains(&session_id) {
            return Ok(());
        }
        entry.sessions.push(session_id);
        self.save_index(&index).await
    }

    /// The order a session was settled by, while it is still in the index.
    pub async fn order_for_session(
        &self,
        session_id: Uuid,
    ) -> Result<Option<OrderRecord>, StorageError> {
        let index = self.load_index().await?;
        match index.iter().find(|e| e.sessions.contains(&session_id)) {
            Some(entry) => self.order_by_id(entry.order_id).await,
            None => Ok(None),
        }
    }

    pub async fn order_by_id(&self, order_id: Uuid) -> Result<Option<OrderRecord>, StorageError> {
        let Some(raw) = self.backend.get(&self.order_key(order_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(order) => Ok(Some(order)),
            Err(e) => {
                warn!(%order_id, error = %e, "order record corrupted");
                Ok(None)
            }
        }
    }

    pub async fn update_order(&self, order: &OrderRecord) -> Result<(), StorageError> {
        self.backend
            .set(&self.order_key(order.order_id), &serde_json::to_string(order)?)
            .await
    }

    /// Removes every active record that carries `intent_id`, linking each
    /// cleared session to the finalized intent.
    pub async fn clear_intent(&self, intent_id: &str) -> Result<usize, StorageError> {
        let mut cleared = 0;
        for key in self.backend.keys(&self.active_prefix()).await? {
            if let Some(record) = self.read_record(&key).await {
                if record.intent_id() == Some(intent_id) {
                    self.link_session(record.session_id, intent_id).await?;
                    self.backend.delete(&key).await?;
                    cleared += 1;
                }
            }
        }
        Ok(cleared)
    }

    pub async fn purge_session(&self, session_id: Uuid) -> Result<(), StorageError> {
        self.backend.delete(&self.active_key(session_id)).await
    }

    pub async fn purge_expired(
        &self,
        retention: Duration,
        finalized_ttl: Duration,
    ) -> Result<PurgeReport, StorageError> {
        self.purge_expired_at(Utc::now(), retention, finalized_ttl)
            .await
    }

    /// Drops active records older than `retention` and finalized orders
    /// older than `finalized_ttl`, measured from `now`.
    pub async fn purge_expired_at(
        &self,
        now: DateTime<Utc>,
        retention: Duration,
        finalized_ttl: Duration,
    ) -> Result<PurgeReport, StorageError> {
        let mut report = PurgeReport::default();
        let record_cutoff = now - chrono::Duration::seconds(retention.as_secs() as i64);
        let order_cutoff = now - chrono::Duration::seconds(finalized_ttl.as_secs() as i64);

        for key in self.backend.keys(&self.active_prefix()).await? {
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            match serde_json::from_str::<RecoveryRecord>(&raw) {
                Ok(record) if record.written_at < record_cutoff => {
                    self.backend.delete(&key).await?;
                    report.expired_records += 1;
                }
                Ok(_) => {}
                Err(_) => {
                    self.backend.delete(&key).await?;
                    report.corrupt_records += 1;
                }
            }
        }

        let _guard = self.index_lock.lock().await;
        let index = self.load_index().await?;
        let (expired, kept): (Vec<_>, Vec<_>) = index
            .into_iter()
            .partition(|e| e.finalized_at < order_cutoff);
        if !expired.is_empty() {
            self.save_index(&kept).await?;
            for entry in &expired {
                self.delete_quietly(&self.order_key(entry.order_id)).await;
            }
            report.expired_orders = expired.len();
        }

        if report.total() > 0 {
            info!(
                expired_records = report.expired_records,
                corrupt_records = report.corrupt_records,
                expired_orders = report.expired_orders,
                "purged checkout journal"
            );
        }
        Ok(report)
    }

    async fn delete_quietly(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            warn!(key, error = %e, "failed to delete journal entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Cart, DeliveryDetails, IntentStatus, JournalStage, LineItem, OrderStatus, PaymentIntent,
        ProviderKind,
    };
    use crate::storage::InMemoryStorage;
    use rust_decimal_macros::dec;

    fn cart() -> Cart {
        Cart::new(vec![LineItem::new("suya", "Beef Suya", dec!(10.99), 2)])
    }

    fn store(backend: &InMemoryStorage, capacity: usize) -> RecoveryStore {
        RecoveryStore::new(Arc::new(backend.clone()), "test:checkout", capacity)
    }

    fn order(intent_id: &str, finalized_at: DateTime<Utc>) -> OrderRecord {
        let order_id = OrderRecord::order_id_for(intent_id);
        OrderRecord {
            order_id,
            order_number: OrderRecord::order_number_for(order_id),
            intent_id: intent_id.into(),
            finalized_at,
            subtotal: dec!(21.98),
            fee: dec!(0),
            total: dec!(21.98),
            currency: "GBP".into(),
            delivery_details: DeliveryDetails::pickup("Ada Obi", "ada@example.com", "07700900123"),
            items: cart().items,
            provider_kind: ProviderKind::Card,
            status: OrderStatus::Completed,
            notification_pending: false,
        }
    }

    #[tokio::test]
    async fn write_then_read_by_session() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let session_id = Uuid::new_v4();
        let record = RecoveryRecord::new(session_id, JournalStage::SelectingProvider, cart());
        store.write_intent(&record).await.unwrap();

        assert_eq!(store.read_latest(Some(session_id)).await, Some(record));
        assert!(store.read_latest(Some(Uuid::new_v4())).await.is_none());
    }

    #[tokio::test]
    async fn read_latest_without_hint_picks_newest() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let mut older = RecoveryRecord::new(Uuid::new_v4(), JournalStage::CollectingDetails, cart());
        older.written_at = Utc::now() - chrono::Duration::minutes(5);
        let newer = RecoveryRecord::new(Uuid::new_v4(), JournalStage::AwaitingCompletion, cart());
        store.write_intent(&older).await.unwrap();
        store.write_intent(&newer).await.unwrap();

        let latest = store.read_latest(None).await.unwrap();
        assert_eq!(latest.session_id, newer.session_id);
    }

    #[tokio::test]
    async fn corrupted_entry_reads_as_none_and_is_removed() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let session_id = Uuid::new_v4();
        backend
            .set(&format!("test:checkout:active:{}", session_id), "{\"session_id\": tru")
            .await
            .unwrap();

        assert!(store.read_latest(Some(session_id)).await.is_none());
        assert!(backend.is_empty());
    }

    #[tokio::test]
    async fn unavailable_storage_reads_as_none() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let record = RecoveryRecord::new(Uuid::new_v4(), JournalStage::SelectingProvider, cart());
        store.write_intent(&record).await.unwrap();
        backend.set_available(false);
        assert!(store.read_latest(Some(record.session_id)).await.is_none());
        assert!(store.read_latest(None).await.is_none());
    }

    #[tokio::test]
    async fn mark_finalized_is_once_per_intent() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let order = order("pi_1", Utc::now());
        assert!(store.mark_finalized(&order).await.unwrap());
        assert!(!store.mark_finalized(&order).await.unwrap());
        assert_eq!(store.finalized_order("pi_1").await.unwrap(), Some(order));
    }

    #[tokio::test]
    async fn finalized_index_is_bounded() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 2);
        let start = Utc::now();
        for (i, id) in ["pi_a", "pi_b", "pi_c"].iter().enumerate() {
            let at = start + chrono::Duration::seconds(i as i64);
            store.mark_finalized(&order(id, at)).await.unwrap();
        }
        assert!(store.finalized_order("pi_a").await.unwrap().is_none());
        assert!(store.finalized_order("pi_b").await.unwrap().is_some());
        assert!(store.finalized_order("pi_c").await.unwrap().is_some());
        assert!(store
            .order_by_id(OrderRecord::order_id_for("pi_a"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn clear_intent_removes_matching_records_only() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let mut paying = RecoveryRecord::new(Uuid::new_v4(), JournalStage::AwaitingCompletion, cart());
        paying.payment_intent = Some(
            PaymentIntent::new("pi_9", ProviderKind::Card, 2198, "GBP")
                .with_status(IntentStatus::Captured)
                .unwrap(),
        );
        let other = RecoveryRecord::new(Uuid::new_v4(), JournalStage::SelectingProvider, cart());
        store.write_intent(&paying).await.unwrap();
        store.write_intent(&other).await.unwrap();

        assert_eq!(store.clear_intent("pi_9").await.unwrap(), 1);
        assert!(store.read_latest(Some(paying.session_id)).await.is_none());
        assert!(store.read_latest(Some(other.session_id)).await.is_some());
    }

    #[tokio::test]
    async fn purge_drops_stale_records_and_orders() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let now = Utc::now();

        let mut stale = RecoveryRecord::new(Uuid::new_v4(), JournalStage::SelectingProvider, cart());
        stale.written_at = now - chrono::Duration::hours(30);
        let fresh = RecoveryRecord::new(Uuid::new_v4(), JournalStage::SelectingProvider, cart());
        store.write_intent(&stale).await.unwrap();
        store.write_intent(&fresh).await.unwrap();
        backend
            .set("test:checkout:active:garbage", "not json")
            .await
            .unwrap();
        store
            .mark_finalized(&order("pi_old", now - chrono::Duration::days(8)))
            .await
            .unwrap();
        store.mark_finalized(&order("pi_new", now)).await.unwrap();

        let report = store
            .purge_expired_at(
                now,
                Duration::from_secs(24 * 3600),
                Duration::from_secs(7 * 24 * 3600),
            )
            .await
            .unwrap();
        assert_eq!(
            report,
            PurgeReport {
                expired_records: 1,
                corrupt_records: 1,
                expired_orders: 1
            }
        );
        assert!(store.read_latest(Some(fresh.session_id)).await.is_some());
        assert!(store.finalized_order("pi_old").await.unwrap().is_none());
        assert!(store.finalized_order("pi_new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cleared_sessions_still_find_their_order() {
        let backend = InMemoryStorage::new();
        let store = store(&backend, 10);
        let mut paying = RecoveryRecord::new(Uuid::new_v4(), JournalStage::AwaitingCompletion, cart());
        paying.payment_intent = Some(
            PaymentIntent::new("pi_7", ProviderKind::Card, 2198, "GBP")
                .with_status(IntentStatus::Captured)
                .unwrap(),
        );
        store.write_intent(&paying).await.unwrap();
        let finalized = order("pi_7", Utc::now());
        store.mark_finalized(&finalized).await.unwrap();

        store.clear_intent("pi_7").await.unwrap();
        assert!(store.read_latest(Some(paying.session_id)).await.is_none());
        assert_eq!(
            store.order_for_session(paying.session_id).await.unwrap(),
            Some(finalized)
        );
        assert!(store.order_for_session(Uuid::new_v4()).await.unwrap().is_none());
    }
}
