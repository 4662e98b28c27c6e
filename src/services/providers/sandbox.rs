//! In-process provider used for local runs and tests.
//!
//! Outcomes are scripted per intent at creation time, and each provider
//! kind answers in its own raw status vocabulary so the adapters'
//! normalization tables are exercised exactly as against a live backend.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::client::{
    ConfirmIntentRequest, CreateIntentRequest, IntentResponse, ProviderClient,
    ProviderClientError,
};
use crate::models::ProviderKind;

const WALLET_APPROVAL_URL: &str = "https://sandbox.wallet.invalid/approve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxOutcome {
    Approve,
    Decline,
    UserCancels,
    /// Payment stays pending; never reaches capture.
    Pending,
}

struct Vocabulary {
    prefix: &'static str,
    created: &'static str,
    pending: &'static str,
    captured: &'static str,
    cancelled: &'static str,
}

fn vocabulary(kind: ProviderKind) -> Vocabulary {
    match kind {
        ProviderKind::Card => Vocabulary {
            prefix: "pi",
            created: "requires_confirmation",
            pending: "processing",
            captured: "succeeded",
            cancelled: "canceled",
        },
        ProviderKind::RedirectWallet => Vocabulary {
            prefix: "wl",
            created: "created",
            pending: "payer_action_required",
            captured: "completed",
            cancelled: "voided",
        },
        ProviderKind::BankDebit => Vocabulary {
            prefix: "bd",
            created: "created",
            pending: "pending_submission",
            captured: "paid_out",
            cancelled: "cancelled",
        },
    }
}

struct SandboxIntent {
    status: String,
    outcome: SandboxOutcome,
    redirect_url: Option<String>,
}

#[derive(Default)]
struct SandboxState {
    intents: HashMap<String, SandboxIntent>,
    by_idempotency_key: HashMap<String, String>,
    script: VecDeque<SandboxOutcome>,
    unavailable_remaining: u32,
    calls: HashMap<&'static str, u32>,
}

pub struct SandboxProviderClient {
    kind: ProviderKind,
    latency: Option<Duration>,
    state: Mutex<SandboxState>,
}

impl SandboxProviderClient {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            latency: None,
            state: Mutex::new(SandboxState::default()),
        }
    }

    /// Every call sleeps this long before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues the outcome for the next intent created.
    pub fn script(&self, outcome: SandboxOutcome) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(outcome);
        }
        self
    }

    /// The next `calls` requests fail as transport errors.
    pub fn fail_next(&self, calls: u32) -> &Self {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable_remaining = calls;
        }
        self
    }

    /// Overrides the provider-side status, as a webhook or settlement would.
    pub fn set_remote_status(&self, intent_id: &str, raw_status: &str) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(intent) = state.intents.get_mut(intent_id) {
                intent.status = raw_status.to_string();
            }
        }
    }

    pub fn calls(&self, operation: &str) -> u32 {
        self.state
            .lock()
            .map(|s| s.calls.get(operation).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn intent_count(&self) -> usize {
        self.state.lock().map(|s| s.intents.len()).unwrap_or(0)
    }

    async fn enter(
        &self,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, SandboxState>, ProviderClientError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProviderClientError::Transport("sandbox state poisoned".into()))?;
        *state.calls.entry(operation).or_insert(0) += 1;
        if state.unavailable_remaining > 0 {
            state.unavailable_remaining -= 1;
            return Err(ProviderClientError::Transport("sandbox outage".into()));
        }
        Ok(state)
    }

    fn respond(intent_id: &str, intent: &SandboxIntent) -> IntentResponse {
        IntentResponse {
            intent_id: intent_id.to_string(),
            status: intent.status.clone(),
            client_secret: None,
            redirect_url: intent.redirect_url.clone(),
            decline_code: None,
            message: None,
        }
    }

    fn declined() -> ProviderClientError {
        ProviderClientError::Declined {
            code: Some("sandbox_decline".into()),
            message: "Declined by sandbox".into(),
        }
    }
}

fn lookup<'a>(
    state: &'a mut SandboxState,
    intent_id: &str,
) -> Result<&'a mut SandboxIntent, ProviderClientError> {
    state
        .intents
        .get_mut(intent_id)
        .ok_or_else(|| ProviderClientError::NotFound(intent_id.to_string()))
}

#[async_trait]
impl ProviderClient for SandboxProviderClient {
    async fn create_intent(
        &self,
        request: CreateIntentRequest,
        idempotency_key: &str,
    ) -> Result<IntentResponse, ProviderClientError> {
        let vocab = vocabulary(self.kind);
        let mut state = self.enter("create").await?;

        if let Some(existing) = state.by_idempotency_key.get(idempotency_key).cloned() {
            let intent = lookup(&mut state, &existing)?;
            return Ok(Self::respond(&existing, intent));
        }
        if request.amount_minor_units <= 0 {
            return Err(ProviderClientError::Status {
                status: 400,
                body: "amount must be positive".into(),
            });
        }

        let outcome = state.script.pop_front().unwrap_or(SandboxOutcome::Approve);
        let intent_id = format!("{}_{}", vocab.prefix, Uuid::new_v4().simple());
        let intent = SandboxIntent {
            status: vocab.created.to_string(),
            outcome,
            redirect_url: None,
        };
        let response = Self::respond(&intent_id, &intent);
        state
            .by_idempotency_key
            .insert(idempotency_key.to_string(), intent_id.clone());
        state.intents.insert(intent_id, intent);
        Ok(IntentResponse {
            client_secret: Some(format!("{}_secret", response.intent_id)),
            ..response
        })
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        request: ConfirmIntentRequest,
    ) -> Result<IntentResponse, ProviderClientError> {
        let vocab = vocabulary(self.kind);
        let kind = self.kind;
        let mut state = self.enter("confirm").await?;
        let intent = lookup(&mut state, intent_id)?;

        if kind == ProviderKind::RedirectWallet {
            // Outcome is decided when the customer comes back and we capture.
            let approval = url::Url::parse_with_params(
                WALLET_APPROVAL_URL,
                &[("token", intent_id), ("return_to", request.return_url.as_str())],
            )
            .map_err(|e| ProviderClientError::Malformed(e.to_string()))?;
            intent.status = vocab.pending.to_string();
            intent.redirect_url = Some(approval.to_string());
            return Ok(Self::respond(intent_id, intent));
        }

        match intent.outcome {
            SandboxOutcome::Decline => {
                intent.status = "failed".to_string();
                Err(Self::declined())
            }
            SandboxOutcome::UserCancels => {
                intent.status = vocab.cancelled.to_string();
                Err(ProviderClientError::Cancelled)
            }
            SandboxOutcome::Pending => {
                intent.status = vocab.pending.to_string();
                Ok(Self::respond(intent_id, intent))
            }
            SandboxOutcome::Approve => {
                intent.status = match kind {
                    ProviderKind::Card => vocab.captured,
                    _ => vocab.pending,
                }
                .to_string();
                Ok(Self::respond(intent_id, intent))
            }
        }
    }

    async fn capture_intent(&self, intent_id: &str) -> Result<IntentResponse, ProviderClientError> {
        let vocab = vocabulary(self.kind);
        let kind = self.kind;
        let mut state = self.enter("capture").await?;
        let intent = lookup(&mut state, intent_id)?;

        if kind != ProviderKind::RedirectWallet || intent.status != vocab.pending {
            return Ok(Self::respond(intent_id, intent));
        }
        match intent.outcome {
            SandboxOutcome::Approve => {
                intent.status = vocab.captured.to_string();
                Ok(Self::respond(intent_id, intent))
            }
            SandboxOutcome::Decline => {
                intent.status = "declined".to_string();
                Err(Self::declined())
            }
            SandboxOutcome::UserCancels => {
                intent.status = vocab.cancelled.to_string();
                Err(ProviderClientError::Cancelled)
            }
            SandboxOutcome::Pending => Ok(Self::respond(intent_id, intent)),
        }
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<IntentResponse, ProviderClientError> {
        let vocab = vocabulary(self.kind);
        let mut state = self.enter("cancel").await?;
        let intent = lookup(&mut state, intent_id)?;
        if intent.status == vocab.captured {
            return Err(ProviderClientError::Status {
                status: 409,
                body: "intent already captured".into(),
            });
        }
        intent.status = vocab.cancelled.to_string();
        Ok(Self::respond(intent_id, intent))
    }

    async fn retrieve_intent(
        &self,
        intent_id: &str,
    ) -> Result<IntentResponse, ProviderClientError> {
        let mut state = self.enter("retrieve").await?;
        let intent = lookup(&mut state, intent_id)?;
        Ok(Self::respond(intent_id, intent))
    }
}
