//! Checkout state machine.
//!
//! `CollectingDetails -> SelectingProvider -> AwaitingCompletion`, ending in
//! `Finalized`, `Failed` or `Abandoned`. Every transition is journaled so the
//! completion page can pick the checkout up after the page state is lost.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::CheckoutSettings;
use crate::errors::CheckoutError;
use crate::events::{CheckoutEvent, EventSender};
use crate::models::{
    Cart, CompletionStrategy, DeliveryDetails, EnvironmentProfile, FulfillmentMode, IntentStatus,
    JournalStage, OrderRecord, PaymentDetails, PaymentIntent, ProviderKind, RecoveryRecord,
};
use crate::services::completion_gateway::CompletionParams;
use crate::services::environment::{EnvironmentProfiler, EnvironmentWarning};
use crate::services::order_finalizer::OrderFinalizer;
use crate::services::pricing::{from_minor_units, to_minor_units, FulfillmentQuote, PricingService};
use crate::services::providers::{
    CheckoutAttempt, CustomerRef, PaymentProviderAdapter, ProviderRegistry,
};
use crate::services::recovery_store::RecoveryStore;

/// Longest a continuation may wait before navigating.
pub const MAX_SETTLE_DELAY: Duration = Duration::from_secs(5);

/// Collaborators shared by every session.
pub struct CheckoutContext {
    pub providers: ProviderRegistry,
    pub recovery: Arc<RecoveryStore>,
    pub finalizer: Arc<OrderFinalizer>,
    pub pricing: PricingService,
    pub settings: CheckoutSettings,
    pub events: Option<EventSender>,
}

impl CheckoutContext {
    async fn emit(&self, event: CheckoutEvent) {
        if let Some(events) = &self.events {
            events.send_or_log(event).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    CollectingDetails,
    SelectingProvider,
    AwaitingCompletion,
    Finalized,
    Failed,
    Abandoned,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Finalized | SessionState::Failed | SessionState::Abandoned
        )
    }

    fn label(self) -> &'static str {
        match self {
            SessionState::CollectingDetails => "collecting details",
            SessionState::SelectingProvider => "selecting a provider",
            SessionState::AwaitingCompletion => "awaiting completion",
            SessionState::Finalized => "finalized",
            SessionState::Failed => "failed",
            SessionState::Abandoned => "abandoned",
        }
    }

    fn journal_stage(self) -> Option<JournalStage> {
        match self {
            SessionState::CollectingDetails => Some(JournalStage::CollectingDetails),
            SessionState::SelectingProvider => Some(JournalStage::SelectingProvider),
            SessionState::AwaitingCompletion => Some(JournalStage::AwaitingCompletion),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContinuationMode {
    Immediate,
    AfterDelay { delay_ms: u64 },
    /// Wait for the customer to press "Continue".
    Manual,
}

/// Where the customer goes next, and when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Continuation {
    pub target: String,
    pub mode: ContinuationMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation<'a> {
    Go(&'a str),
    AwaitCustomer(&'a str),
}

impl Continuation {
    pub fn for_strategy(
        target: impl Into<String>,
        strategy: CompletionStrategy,
        settle_delay: Duration,
    ) -> Self {
        let mode = match strategy {
            CompletionStrategy::ImmediateCallback => ContinuationMode::Immediate,
            CompletionStrategy::DelayedRedirect => ContinuationMode::AfterDelay {
                delay_ms: settle_delay.min(MAX_SETTLE_DELAY).as_millis() as u64,
            },
            CompletionStrategy::ManualContinuation => ContinuationMode::Manual,
        };
        Self {
            target: target.into(),
            mode,
        }
    }

    /// The single suspension point between payment and navigation.
    pub async fn settle(&self) -> Navigation<'_> {
        match self.mode {
            ContinuationMode::Immediate => Navigation::Go(&self.target),
            ContinuationMode::AfterDelay { delay_ms } => {
                let delay = Duration::from_millis(delay_ms).min(MAX_SETTLE_DELAY);
                tokio::time::sleep(delay).await;
                Navigation::Go(&self.target)
            }
            ContinuationMode::Manual => Navigation::AwaitCustomer(&self.target),
        }
    }
}

/// Result of driving a payment as far as it can go in-process.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompletionOutcome {
    Finalized {
        order: OrderRecord,
        next: Continuation,
    },
    /// The customer must visit the provider; the completion page finishes.
    ProviderRedirect {
        intent_id: String,
        next: Continuation,
    },
    /// The provider has not settled yet; the customer checks status manually.
    Pending {
        intent_id: String,
        next: Continuation,
    },
    /// Customer backed out at the provider; pick another method.
    Cancelled { provider: ProviderKind },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionPrompt {
    pub suggested_provider: ProviderKind,
    pub available_providers: Vec<ProviderKind>,
    pub quote: FulfillmentQuote,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderChoice {
    pub provider: ProviderKind,
    pub strategy: CompletionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<EnvironmentWarning>,
}

/// Read-only view of a session for the HTTP layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: Uuid,
    pub state: SessionState,
    pub profile: EnvironmentProfile,
    pub suggested_provider: ProviderKind,
    pub provider: Option<ProviderKind>,
    pub delivery_details: Option<DeliveryDetails>,
    pub quote: FulfillmentQuote,
    pub payment_intent: Option<PaymentIntent>,
    pub order: Option<OrderRecord>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
}

pub struct CheckoutSession {
    id: Uuid,
    state: SessionState,
    cart: Cart,
    profile: EnvironmentProfile,
    details: Option<DeliveryDetails>,
    provider: Option<ProviderKind>,
    suggested: ProviderKind,
    excluded: Option<ProviderKind>,
    intent: Option<PaymentIntent>,
    order: Option<OrderRecord>,
    attempts: u32,
    last_error: Option<String>,
    started_at: DateTime<Utc>,
    awaiting_since: Option<DateTime<Utc>>,
    ctx: Arc<CheckoutContext>,
}

impl std::fmt::Debug for CheckoutSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckoutSession")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("provider", &self.provider)
            .finish()
    }
}

/// Runs `call` and repeats it once if it failed with a retryable error.
async fn with_one_retry<T, F, Fut>(operation: &'static str, mut call: F) -> Result<T, CheckoutError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CheckoutError>>,
{
    match call().await {
        Err(e) if e.is_retryable() => {
            warn!(operation, error = %e, "provider unavailable, retrying once");
            call().await
        }
        other => other,
    }
}

impl CheckoutSession {
    #[instrument(skip_all, fields(items = cart.items.len()))]
    pub async fn start(
        ctx: Arc<CheckoutContext>,
        cart: Cart,
        profile: EnvironmentProfile,
    ) -> Result<Self, CheckoutError> {
        cart.ensure_checkout_ready()?;
        let session = Self {
            id: Uuid::new_v4(),
            state: SessionState::CollectingDetails,
            suggested: EnvironmentProfiler::suggested_provider(&profile),
            cart,
            profile,
            details: None,
            provider: None,
            excluded: None,
            intent: None,
            order: None,
            attempts: 0,
            last_error: None,
            started_at: Utc::now(),
            awaiting_since: None,
            ctx,
        };
        session.journal_or_warn().await;
        info!(session_id = %session.id, restricted = profile.is_restricted_runtime, "checkout started");
        session
            .ctx
            .emit(CheckoutEvent::CheckoutStarted {
                session_id: session.id,
                item_count: session.cart.item_count(),
                subtotal: session.cart.subtotal(),
            })
            .await;
        Ok(session)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn profile(&self) -> &EnvironmentProfile {
        &self.profile
    }

    pub fn intent(&self) -> Option<&PaymentIntent> {
        self.intent.as_ref()
    }

    pub fn order(&self) -> Option<&OrderRecord> {
        self.order.as_ref()
    }

    pub fn suggested_provider(&self) -> ProviderKind {
        self.suggested
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Totals for the current fulfillment mode, pickup until details exist.
    pub fn quote(&self) -> FulfillmentQuote {
        let mode = self
            .details
            .as_ref()
            .map(|d| d.fulfillment_mode)
            .unwrap_or(FulfillmentMode::Pickup);
        self.ctx.pricing.quote(&self.cart, mode)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.state,
            profile: self.profile,
            suggested_provider: self.suggested,
            provider: self.provider,
            delivery_details: self.details.clone(),
            quote: self.quote(),
            payment_intent: self.intent.clone(),
            order: self.order.clone(),
            last_error: self.last_error.clone(),
            started_at: self.started_at,
        }
    }

    fn require(&self, state: SessionState, action: &'static str) -> Result<(), CheckoutError> {
        if self.state == state {
            Ok(())
        } else {
            Err(CheckoutError::InvalidTransition {
                state: self.state.label(),
                action,
            })
        }
    }

    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn submit_details(
        &mut self,
        details: DeliveryDetails,
    ) -> Result<SelectionPrompt, CheckoutError> {
        self.require(SessionState::CollectingDetails, "submit details")?;
        let details = details.normalized();
        details.check().map_err(CheckoutError::Validation)?;

        self.details = Some(details);
        self.state = SessionState::SelectingProvider;
        self.journal_or_warn().await;
        self.ctx
            .emit(CheckoutEvent::DetailsSubmitted {
                session_id: self.id,
            })
            .await;

        Ok(SelectionPrompt {
            suggested_provider: self.suggested,
            available_providers: self.ctx.providers.kinds(),
            quote: self.quote(),
        })
    }

    /// Returns to details entry. Any provider choice is forgotten.
    pub async fn edit_details(&mut self) -> Result<(), CheckoutError> {
        self.require(SessionState::SelectingProvider, "edit details")?;
        self.state = SessionState::CollectingDetails;
        self.provider = None;
        self.journal_or_warn().await;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %self.id, provider = %kind))]
    pub async fn select_provider(&mut self, kind: ProviderKind) -> Result<ProviderChoice, CheckoutError> {
        self.require(SessionState::SelectingProvider, "select a provider")?;
        self.ctx.providers.get(kind)?;

        let strategy = EnvironmentProfiler::strategy_for(&self.profile, kind);
        let warning = EnvironmentProfiler::incompatibility(&self.profile, kind);
        if let Some(w) = &warning {
            info!(recommended = %w.recommended_provider, "provider flagged for this runtime");
        }

        self.provider = Some(kind);
        self.journal_or_warn().await;
        self.ctx
            .emit(CheckoutEvent::ProviderSelected {
                session_id: self.id,
                provider: kind,
                strategy,
            })
            .await;
        Ok(ProviderChoice {
            provider: kind,
            strategy,
            warning,
        })
    }

    /// Creates and confirms the intent, then completes as far as the
    /// runtime's strategy allows.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn begin_payment(
        &mut self,
        payment: PaymentDetails,
    ) -> Result<CompletionOutcome, CheckoutError> {
        self.require(SessionState::SelectingProvider, "begin payment")?;
        let kind = self.provider.unwrap_or(self.suggested);
        payment.check_for(kind)?;
        let details = self
            .details
            .clone()
            .ok_or_else(|| CheckoutError::validation("delivery_details", "Delivery details are required"))?;
        let adapter = self.ctx.providers.get(kind)?;
        self.provider = Some(kind);

        let limit = self.ctx.settings.completion_timeout;
        let driven =
            tokio::time::timeout(limit, self.drive_payment(adapter.clone(), &details, &payment))
                .await;
        match driven {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_secs = limit.as_secs(), "payment did not complete in time");
                self.fail_and_cancel(adapter, "payment completion timed out").await;
                Err(CheckoutError::Timeout("payment completion"))
            }
        }
    }

    async fn drive_payment(
        &mut self,
        adapter: Arc<dyn PaymentProviderAdapter>,
        details: &DeliveryDetails,
        payment: &PaymentDetails,
    ) -> Result<CompletionOutcome, CheckoutError> {
        let quote = self.quote();
        let amount = to_minor_units(quote.total)?;
        self.attempts += 1;
        let customer = CustomerRef {
            full_name: details.full_name.clone(),
            email: details.email.clone(),
            phone: details.phone.clone(),
        };
        let attempt = CheckoutAttempt {
            idempotency_key: format!("{}:{}", self.id, self.attempts),
            return_url: self.return_url(quote.total, adapter.kind()),
        };
        let currency = self.ctx.settings.currency.clone();

        let provider: &dyn PaymentProviderAdapter = adapter.as_ref();
        let (customer_ref, attempt_ref, currency_ref) = (&customer, &attempt, currency.as_str());
        let created = with_one_retry("create_intent", move || {
            provider.create_intent(amount, currency_ref, customer_ref, attempt_ref)
        })
        .await;
        let intent = match created {
            Ok(intent) => intent,
            Err(e) => return self.on_provider_error(e, &adapter).await,
        };

        self.intent = Some(intent.clone());
        self.state = SessionState::AwaitingCompletion;
        self.awaiting_since = Some(Utc::now());
        self.journal_before_navigation(&adapter).await?;
        self.ctx
            .emit(CheckoutEvent::PaymentStarted {
                session_id: self.id,
                intent_id: intent.intent_id.clone(),
                provider: adapter.kind(),
            })
            .await;

        let intent_ref = &intent;
        let confirmed = with_one_retry("confirm", move || {
            provider.confirm(intent_ref, payment, attempt_ref)
        })
        .await;
        match confirmed {
            Ok(confirmed) => self.complete_with(confirmed, &adapter).await,
            Err(e) => self.on_provider_error(e, &adapter).await,
        }
    }

    /// Customer came back from the provider's page in this same session.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn resume_after_redirect(&mut self) -> Result<CompletionOutcome, CheckoutError> {
        self.adopt_recorded_order().await?;
        if self.state == SessionState::Finalized {
            if let Some(order) = &self.order {
                return Ok(CompletionOutcome::Finalized {
                    next: self.confirmation_continuation(order, CompletionStrategy::ImmediateCallback),
                    order: order.clone(),
                });
            }
        }
        self.require(SessionState::AwaitingCompletion, "resume after redirect")?;
        let kind = self.provider.ok_or(CheckoutError::InvalidTransition {
            state: "awaiting completion without a provider",
            action: "resume after redirect",
        })?;
        let intent = self.intent.clone().ok_or(CheckoutError::InvalidTransition {
            state: "awaiting completion without an intent",
            action: "resume after redirect",
        })?;
        let adapter = self.ctx.providers.get(kind)?;

        let limit = self.ctx.settings.completion_timeout;
        let provider: &dyn PaymentProviderAdapter = adapter.as_ref();
        let intent_ref = &intent;
        let captured = tokio::time::timeout(
            limit,
            with_one_retry("capture", move || provider.capture(intent_ref)),
        )
        .await;
        match captured {
            Ok(Ok(captured)) => self.complete_with(captured, &adapter).await,
            Ok(Err(e)) => self.on_provider_error(e, &adapter).await,
            Err(_) => {
                self.fail_and_cancel(adapter, "capture timed out").await;
                Err(CheckoutError::Timeout("capture"))
            }
        }
    }

    async fn complete_with(
        &mut self,
        intent: PaymentIntent,
        adapter: &Arc<dyn PaymentProviderAdapter>,
    ) -> Result<CompletionOutcome, CheckoutError> {
        let strategy = EnvironmentProfiler::strategy_for(&self.profile, adapter.kind());
        self.intent = Some(intent.clone());

        if intent.is_session_success() {
            let details = self
                .details
                .clone()
                .ok_or_else(|| CheckoutError::Internal("details lost before finalize".into()))?;
            let order = self.ctx.finalizer.finalize(&intent, &details, &self.cart).await?;
            self.state = SessionState::Finalized;
            self.awaiting_since = None;
            self.order = Some(order.clone());
            return Ok(CompletionOutcome::Finalized {
                next: self.confirmation_continuation(&order, strategy),
                order,
            });
        }

        if intent.status == IntentStatus::AwaitingConfirmation && adapter.redirects() {
            self.journal_before_navigation(adapter).await?;
            let target = intent
                .redirect_url
                .clone()
                .ok_or_else(|| CheckoutError::ProviderUnavailable {
                    provider: adapter.kind(),
                    message: "no redirect target for awaiting intent".into(),
                })?;
            debug!(intent_id = %intent.intent_id, %strategy, "handing customer to provider");
            return Ok(CompletionOutcome::ProviderRedirect {
                intent_id: intent.intent_id,
                next: Continuation::for_strategy(target, strategy, self.ctx.settings.settle_delay),
            });
        }

        self.journal_or_warn().await;
        let status_page = CompletionParams {
            session_id: Some(self.id),
            provider_kind: Some(adapter.kind()),
            amount: Some(from_minor_units(intent.amount_minor_units)),
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
        .to_url(&self.ctx.settings.completion_url);
        Ok(CompletionOutcome::Pending {
            intent_id: intent.intent_id,
            next: Continuation::for_strategy(
                status_page,
                CompletionStrategy::ManualContinuation,
                self.ctx.settings.settle_delay,
            ),
        })
    }

    async fn on_provider_error(
        &mut self,
        err: CheckoutError,
        adapter: &Arc<dyn PaymentProviderAdapter>,
    ) -> Result<CompletionOutcome, CheckoutError> {
        match err {
            CheckoutError::UserCancelled { provider } => {
                if let Some(intent) = self.intent.take() {
                    adapter.cancel(&intent).await;
                }
                self.state = SessionState::SelectingProvider;
                self.awaiting_since = None;
                self.journal_or_warn().await;
                info!(session_id = %self.id, %provider, "customer cancelled at provider");
                self.ctx
                    .emit(CheckoutEvent::PaymentCancelled {
                        session_id: self.id,
                        provider,
                    })
                    .await;
                Ok(CompletionOutcome::Cancelled { provider })
            }
            CheckoutError::DeclinedByProvider { .. } => {
                self.mark_intent(IntentStatus::Failed);
                self.fail(&err).await;
                Err(err)
            }
            CheckoutError::ProviderUnavailable { .. } => {
                if let Some(intent) = &self.intent {
                    adapter.cancel(intent).await;
                }
                self.mark_intent(IntentStatus::Cancelled);
                self.fail(&err).await;
                Err(err)
            }
            other => Err(other),
        }
    }

    async fn fail(&mut self, err: &CheckoutError) {
        warn!(session_id = %self.id, error = %err, "checkout failed");
        self.state = SessionState::Failed;
        self.awaiting_since = None;
        self.last_error = Some(err.to_string());
        if let Err(e) = self.ctx.recovery.purge_session(self.id).await {
            warn!(error = %e, "failed to purge journal for failed session");
        }
        if let Some(provider) = self.provider {
            self.ctx
                .emit(CheckoutEvent::PaymentFailed {
                    session_id: self.id,
                    provider,
                    reason: err.code().to_string(),
                })
                .await;
        }
    }

    /// Marks the session failed and cancels the intent without waiting.
    async fn fail_and_cancel(&mut self, adapter: Arc<dyn PaymentProviderAdapter>, reason: &'static str) {
        if let Some(pending) = self.intent.clone() {
            tokio::spawn(async move { adapter.cancel(&pending).await });
        }
        self.mark_intent(IntentStatus::Cancelled);
        self.fail(&CheckoutError::Timeout(reason)).await;
    }

    /// Records a status the provider already reached for the local intent.
    fn mark_intent(&mut self, status: IntentStatus) {
        if let Some(intent) = self.intent.as_mut() {
            if let Err(e) = intent.transition(status) {
                warn!(session_id = %self.id, error = %e, "intent status left unchanged");
            }
        }
    }

    /// Picks up an order recorded for this session's intent elsewhere, most
    /// often by the completion page after a provider redirect. Returns
    /// whether the session moved to `Finalized`.
    pub async fn adopt_recorded_order(&mut self) -> Result<bool, CheckoutError> {
        if self.state != SessionState::AwaitingCompletion {
            return Ok(false);
        }
        let Some(intent_id) = self.intent.as_ref().map(|i| i.intent_id.clone()) else {
            return Ok(false);
        };
        let Some(order) = self.ctx.finalizer.existing(&intent_id).await? else {
            return Ok(false);
        };
        if self.intent.as_ref().is_some_and(|i| !i.is_session_success()) {
            self.mark_intent(IntentStatus::Captured);
        }
        info!(session_id = %self.id, order_number = %order.order_number, "order recorded outside the session");
        self.state = SessionState::Finalized;
        self.awaiting_since = None;
        self.order = Some(order);
        Ok(true)
    }

    /// Asks the provider where a stale intent stands. A payment that went
    /// through is finalized; anything else is failed and cancelled.
    async fn settle_stale_payment(&mut self) -> Result<(), CheckoutError> {
        let Some(kind) = self.provider else {
            self.fail(&CheckoutError::Timeout("payment completion")).await;
            return Ok(());
        };
        let adapter = self.ctx.providers.get(kind)?;
        if let Some(intent) = self.intent.clone() {
            let limit = self.ctx.settings.completion_timeout;
            match tokio::time::timeout(limit, adapter.refresh(&intent)).await {
                Ok(Ok(current)) if current.is_session_success() => {
                    info!(session_id = %self.id, intent_id = %current.intent_id, "stale intent settled at provider");
                    self.complete_with(current, &adapter).await?;
                    return Ok(());
                }
                Ok(Ok(current)) => self.intent = Some(current),
                Ok(Err(e)) => warn!(session_id = %self.id, error = %e, "could not refresh stale intent"),
                Err(_) => warn!(session_id = %self.id, "refreshing stale intent timed out"),
            }
        }
        self.fail_and_cancel(adapter, "payment completion").await;
        Ok(())
    }

    /// Abandons a session that has not started paying. The journal entry
    /// is removed.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn abandon(&mut self) -> Result<(), CheckoutError> {
        match self.state {
            SessionState::Abandoned => return Ok(()),
            SessionState::CollectingDetails | SessionState::SelectingProvider => {}
            _ => {
                return Err(CheckoutError::InvalidTransition {
                    state: self.state.label(),
                    action: "abandon",
                })
            }
        }
        self.state = SessionState::Abandoned;
        self.ctx.recovery.purge_session(self.id).await?;
        info!("checkout abandoned");
        self.ctx
            .emit(CheckoutEvent::CheckoutAbandoned {
                session_id: self.id,
            })
            .await;
        Ok(())
    }

    /// Applies the lifetime limits and adopts an order recorded elsewhere.
    /// Returns whether the session changed.
    pub async fn expire_if_stale(&mut self, now: DateTime<Utc>) -> Result<bool, CheckoutError> {
        match self.state {
            SessionState::CollectingDetails | SessionState::SelectingProvider => {
                if exceeded(self.started_at, now, self.ctx.settings.session_max_lifetime) {
                    self.abandon().await?;
                    return Ok(true);
                }
            }
            SessionState::AwaitingCompletion => {
                match self.adopt_recorded_order().await {
                    Ok(true) => return Ok(true),
                    Ok(false) => {}
                    Err(e) => warn!(session_id = %self.id, error = %e, "could not look up recorded order"),
                }
                let since = self.awaiting_since.unwrap_or(self.started_at);
                if exceeded(since, now, self.ctx.settings.completion_timeout) {
                    self.settle_stale_payment().await?;
                    return Ok(true);
                }
            }
            _ => {}
        }
        Ok(false)
    }

    /// New attempt from a failed session: same cart and details, straight
    /// to provider selection, steering away from the provider that failed.
    pub async fn retry_attempt(&self) -> Result<CheckoutSession, CheckoutError> {
        self.require(SessionState::Failed, "retry")?;
        let details = self.details.clone().ok_or(CheckoutError::InvalidTransition {
            state: "failed before details were collected",
            action: "retry",
        })?;

        let excluded = self.provider;
        let preferred = EnvironmentProfiler::suggested_provider(&self.profile);
        let suggested = if Some(preferred) == excluded {
            self.ctx
                .providers
                .kinds()
                .into_iter()
                .find(|k| Some(*k) != excluded)
                .unwrap_or(preferred)
        } else {
            preferred
        };

        let session = CheckoutSession {
            id: Uuid::new_v4(),
            state: SessionState::SelectingProvider,
            cart: self.cart.clone(),
            profile: self.profile,
            details: Some(details),
            provider: None,
            suggested,
            excluded,
            intent: None,
            order: None,
            attempts: 0,
            last_error: None,
            started_at: Utc::now(),
            awaiting_since: None,
            ctx: self.ctx.clone(),
        };
        session.journal_or_warn().await;
        info!(previous = %self.id, session_id = %session.id, %suggested, "retrying checkout");
        Ok(session)
    }

    /// Provider the previous attempt failed with, if this is a retry.
    pub fn excluded_provider(&self) -> Option<ProviderKind> {
        self.excluded
    }

    fn record(&self) -> Option<RecoveryRecord> {
        let stage = self.state.journal_stage()?;
        let mut record = RecoveryRecord::new(self.id, stage, self.cart.clone());
        record.provider_kind = self.provider;
        record.delivery_details = self.details.clone();
        if stage == JournalStage::AwaitingCompletion {
            record.payment_intent = self.intent.clone();
        }
        Some(record)
    }

    async fn journal(&self) -> Result<(), CheckoutError> {
        match self.record() {
            Some(record) => Ok(self.ctx.recovery.write_intent(&record).await?),
            None => Ok(()),
        }
    }

    async fn journal_or_warn(&self) {
        if let Err(e) = self.journal().await {
            warn!(session_id = %self.id, error = %e, "journal write failed");
        }
    }

    /// Redirecting providers must not navigate away without a journal entry:
    /// on failure the intent is cancelled and the session goes back to
    /// provider selection.
    async fn journal_before_navigation(
        &mut self,
        adapter: &Arc<dyn PaymentProviderAdapter>,
    ) -> Result<(), CheckoutError> {
        let Err(e) = self.journal().await else {
            return Ok(());
        };
        if !adapter.redirects() {
            warn!(session_id = %self.id, error = %e, "journal write failed");
            return Ok(());
        }
        warn!(session_id = %self.id, error = %e, "journal write failed before redirect, aborting attempt");
        if let Some(intent) = self.intent.take() {
            adapter.cancel(&intent).await;
        }
        self.state = SessionState::SelectingProvider;
        self.awaiting_since = None;
        Err(e)
    }

    fn return_url(&self, total: Decimal, kind: ProviderKind) -> String {
        CompletionParams {
            session_id: Some(self.id),
            amount: Some(total),
            provider_kind: Some(kind),
            timestamp: Some(Utc::now()),
            order_id: None,
        }
        .to_url(&self.ctx.settings.completion_url)
    }

    fn confirmation_continuation(
        &self,
        order: &OrderRecord,
        strategy: CompletionStrategy,
    ) -> Continuation {
        let target = CompletionParams {
            order_id: Some(order.order_id),
            amount: Some(order.total),
            provider_kind: Some(order.provider_kind),
            timestamp: Some(order.finalized_at),
            session_id: Some(self.id),
        }
        .to_url(&self.ctx.settings.completion_url);
        Continuation::for_strategy(target, strategy, self.ctx.settings.settle_delay)
    }
}

fn exceeded(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since)
        .to_std()
        .map(|elapsed| elapsed > limit)
        .unwrap_or(false)
}
