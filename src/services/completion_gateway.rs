//! The page a customer lands on after paying, however they got there: the
//! in-process continuation, a provider redirect, a reload or a second tab.
//! Every path converges on the same finalized order.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::config::CheckoutSettings;
use crate::errors::CheckoutError;
use crate::models::{IntentStatus, OrderRecord, PaymentIntent, ProviderKind, RecoveryRecord};
use crate::services::order_finalizer::OrderFinalizer;
use crate::services::providers::ProviderRegistry;
use crate::services::recovery_store::RecoveryStore;

const ORDER_ID: &str = "orderId";
const AMOUNT: &str = "amount";
const PROVIDER_KIND: &str = "providerKind";
const TIMESTAMP: &str = "timestamp";
const SESSION_ID: &str = "sessionId";

/// Query parameters carried on the completion URL.
///
/// Advisory only. They locate a checkout but never decide its total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionParams {
    pub order_id: Option<Uuid>,
    pub amount: Option<Decimal>,
    pub provider_kind: Option<ProviderKind>,
    pub timestamp: Option<DateTime<Utc>>,
    pub session_id: Option<Uuid>,
}

impl CompletionParams {
    /// Parses a query string, ignoring anything malformed.
    pub fn from_query(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in form_urlencoded::parse(query.trim_start_matches('?').as_bytes()) {
            match key.as_ref() {
                ORDER_ID => params.order_id = Uuid::parse_str(&value).ok(),
                AMOUNT => params.amount = Decimal::from_str(&value).ok(),
                PROVIDER_KIND => params.provider_kind = ProviderKind::from_str(&value).ok(),
                TIMESTAMP => {
                    params.timestamp = value
                        .parse::<i64>()
                        .ok()
                        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                }
                SESSION_ID => params.session_id = Uuid::parse_str(&value).ok(),
                other => debug!(param = other, "ignoring unknown completion parameter"),
            }
        }
        params
    }

    pub fn to_query(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        if let Some(order_id) = self.order_id {
            query.append_pair(ORDER_ID, &order_id.to_string());
        }
        if let Some(amount) = self.amount {
            query.append_pair(AMOUNT, &amount.to_string());
        }
        if let Some(kind) = self.provider_kind {
            query.append_pair(PROVIDER_KIND, &kind.to_string());
        }
        if let Some(timestamp) = self.timestamp {
            query.append_pair(TIMESTAMP, &timestamp.timestamp_millis().to_string());
        }
        if let Some(session_id) = self.session_id {
            query.append_pair(SESSION_ID, &session_id.to_string());
        }
        query.finish()
    }

    pub fn to_url(&self, base: &str) -> String {
        let query = self.to_query();
        if query.is_empty() {
            base.to_string()
        } else if base.contains('?') {
            format!("{}&{}", base, query)
        } else {
            format!("{}?{}", base, query)
        }
    }
}

/// What the URL claims, shown while the real status is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisoryReceipt {
    pub order_number: Option<String>,
    pub amount: Option<Decimal>,
    pub provider_kind: Option<ProviderKind>,
    pub timestamp: Option<DateTime<Utc>>,
    /// Always false: nothing here has been verified.
    pub authoritative: bool,
}

impl From<&CompletionParams> for AdvisoryReceipt {
    fn from(params: &CompletionParams) -> Self {
        Self {
            order_number: params.order_id.map(OrderRecord::order_number_for),
            amount: params.amount,
            provider_kind: params.provider_kind,
            timestamp: params.timestamp,
            authoritative: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompletionView {
    Confirmed {
        order: OrderRecord,
    },
    Failed {
        provider: ProviderKind,
        reason: String,
    },
    /// Status could not be established. `check_session` feeds the manual
    /// status check when a journaled session is known.
    Unknown {
        receipt: AdvisoryReceipt,
        #[serde(rename = "checkSession", skip_serializing_if = "Option::is_none")]
        check_session: Option<Uuid>,
    },
}

/// Which journal records a load may recover without a session hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryScope {
    /// Only the session named in the URL. For shared, server-side journals.
    SessionOnly,
    /// Fall back to the newest record. For journals private to one customer.
    LatestAny,
}

pub struct CompletionGateway {
    recovery: Arc<RecoveryStore>,
    finalizer: Arc<OrderFinalizer>,
    providers: ProviderRegistry,
    settings: CheckoutSettings,
    scope: RecoveryScope,
}

impl CompletionGateway {
    pub fn new(
        recovery: Arc<RecoveryStore>,
        finalizer: Arc<OrderFinalizer>,
        providers: ProviderRegistry,
        settings: CheckoutSettings,
        scope: RecoveryScope,
    ) -> Self {
        Self {
            recovery,
            finalizer,
            providers,
            settings,
            scope,
        }
    }

    /// Resolves the completion page. Never fails: anything that cannot be
    /// established renders as `Unknown` with a manual check.
    #[instrument(skip_all, fields(order_id = ?params.order_id, session_id = ?params.session_id))]
    pub async fn load(&self, params: &CompletionParams) -> CompletionView {
        if let Err(e) = self
            .recovery
            .purge_expired(self.settings.recovery_retention, self.settings.finalized_ttl)
            .await
        {
            debug!(error = %e, "opportunistic purge skipped");
        }

        if let Some(order_id) = params.order_id {
            match self.recovery.order_by_id(order_id).await {
                Ok(Some(order)) => {
                    if let Some(session_id) = params.session_id {
                        self.purge_quietly(session_id).await;
                    }
                    return CompletionView::Confirmed { order };
                }
                Ok(None) => debug!("order from URL not recorded yet"),
                Err(e) => warn!(error = %e, "order lookup failed"),
            }
        }

        let hint = match (params.session_id, self.scope) {
            (Some(session_id), _) => Some(session_id),
            (None, RecoveryScope::LatestAny) => None,
            (None, RecoveryScope::SessionOnly) => return self.unknown(params, None),
        };
        match self.recovery.read_latest(hint).await {
            Some(record) => self.resolve(record, params, false).await,
            None => self.settled_session(hint, params).await,
        }
    }

    /// Manual status check: asks the provider afresh, then resolves.
    #[instrument(skip(self))]
    pub async fn check_status(&self, session_id: Uuid) -> CompletionView {
        let params = CompletionParams {
            session_id: Some(session_id),
            ..Default::default()
        };
        match self.recovery.read_latest(Some(session_id)).await {
            Some(record) => self.resolve(record, &params, true).await,
            None => self.settled_session(Some(session_id), &params).await,
        }
    }

    /// No journal entry left: the session may already have been settled.
    async fn settled_session(
        &self,
        session_id: Option<Uuid>,
        params: &CompletionParams,
    ) -> CompletionView {
        let Some(session_id) = session_id else {
            return self.unknown(params, None);
        };
        match self.recovery.order_for_session(session_id).await {
            Ok(Some(order)) => CompletionView::Confirmed { order },
            Ok(None) => self.unknown(params, None),
            Err(e) => {
                warn!(%session_id, error = %e, "settled session lookup failed");
                self.unknown(params, None)
            }
        }
    }

    async fn resolve(
        &self,
        record: RecoveryRecord,
        params: &CompletionParams,
        refresh: bool,
    ) -> CompletionView {
        let session_id = record.session_id;
        let Some(journaled) = record.payment_intent.clone() else {
            debug!(%session_id, stage = ?record.stage, "journaled session has no intent yet");
            return self.unknown(params, None);
        };

        match self.finalizer.existing(&journaled.intent_id).await {
            Ok(Some(order)) => return self.confirmed(session_id, order).await,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "finalized lookup failed"),
        }

        let intent = match self.settle_intent(journaled, refresh).await {
            Ok(intent) => intent,
            Err(CheckoutError::DeclinedByProvider { provider, message, .. }) => {
                return self.failed(session_id, provider, message).await
            }
            Err(CheckoutError::UserCancelled { provider }) => {
                return self
                    .failed(session_id, provider, "Payment was cancelled".into())
                    .await
            }
            Err(e) => {
                warn!(%session_id, error = %e, "could not establish payment status");
                return self.unknown(params, Some(session_id));
            }
        };

        match intent.status {
            IntentStatus::Failed => {
                return self
                    .failed(session_id, intent.provider_kind, "Payment failed".into())
                    .await
            }
            IntentStatus::Cancelled => {
                return self
                    .failed(session_id, intent.provider_kind, "Payment was cancelled".into())
                    .await
            }
            _ => {}
        }
        if !intent.is_session_success() {
            return self.unknown(params, Some(session_id));
        }

        let Some(details) = record.delivery_details.as_ref() else {
            warn!(%session_id, "journal lacks delivery details, cannot finalize");
            return self.unknown(params, Some(session_id));
        };
        match self.finalizer.finalize(&intent, details, &record.cart).await {
            Ok(order) => {
                info!(%session_id, order_id = %order.order_id, "checkout recovered on completion page");
                self.confirmed(session_id, order).await
            }
            Err(e) => {
                warn!(%session_id, error = %e, "finalize from journal failed");
                self.unknown(params, Some(session_id))
            }
        }
    }

    /// Brings the journaled intent up to date: a provider read when asked,
    /// then capture for redirect providers still awaiting it.
    async fn settle_intent(
        &self,
        intent: PaymentIntent,
        refresh: bool,
    ) -> Result<PaymentIntent, CheckoutError> {
        if intent.is_terminal() {
            return Ok(intent);
        }
        let adapter = self.providers.get(intent.provider_kind)?;
        let mut current = if refresh {
            adapter.refresh(&intent).await?
        } else {
            intent
        };
        if current.status == IntentStatus::AwaitingConfirmation && adapter.redirects() {
            current = adapter.capture(&current).await?;
        }
        Ok(current)
    }

    async fn confirmed(&self, session_id: Uuid, order: OrderRecord) -> CompletionView {
        if let Err(e) = self.recovery.link_session(session_id, &order.intent_id).await {
            warn!(%session_id, error = %e, "failed to link session to its order");
        }
        self.purge_quietly(session_id).await;
        CompletionView::Confirmed { order }
    }

    async fn failed(&self, session_id: Uuid, provider: ProviderKind, reason: String) -> CompletionView {
        self.purge_quietly(session_id).await;
        CompletionView::Failed { provider, reason }
    }

    fn unknown(&self, params: &CompletionParams, session_id: Option<Uuid>) -> CompletionView {
        CompletionView::Unknown {
            receipt: AdvisoryReceipt::from(params),
            check_session: session_id.or(params.session_id),
        }
    }

    async fn purge_quietly(&self, session_id: Uuid) {
        if let Err(e) = self.recovery.purge_session(session_id).await {
            warn!(%session_id, error = %e, "failed to purge journal entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn query_round_trip_keeps_fields() {
        let params = CompletionParams {
            order_id: Some(Uuid::new_v4()),
            amount: Some(dec!(25.48)),
            provider_kind: Some(ProviderKind::RedirectWallet),
            timestamp: Utc.timestamp_millis_opt(1_760_000_000_123).single(),
            session_id: Some(Uuid::new_v4()),
        };
        let query = params.to_query();
        assert!(query.contains("providerKind=redirect_wallet"));
        assert_eq!(CompletionParams::from_query(&query), params);
    }

    #[test]
    fn malformed_params_are_dropped() {
        let params = CompletionParams::from_query("?orderId=nope&amount=ten&providerKind=cash&sessionId=&extra=1");
        assert_eq!(params, CompletionParams::default());
    }

    #[test]
    fn to_url_appends_to_existing_query() {
        let params = CompletionParams {
            amount: Some(dec!(1.50)),
            ..Default::default()
        };
        assert_eq!(params.to_url("/complete"), "/complete?amount=1.50");
        assert_eq!(params.to_url("/complete?x=1"), "/complete?x=1&amount=1.50");
        assert_eq!(CompletionParams::default().to_url("/complete"), "/complete");
    }

    #[test]
    fn receipt_is_never_authoritative() {
        let receipt = AdvisoryReceipt::from(&CompletionParams {
            order_id: Some(OrderRecord::order_id_for("pi_1")),
            amount: Some(dec!(0.01)),
            ..Default::default()
        });
        assert!(!receipt.authoritative);
        assert!(receipt.order_number.unwrap().starts_with("ORD-"));
    }
}
