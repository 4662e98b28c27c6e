//! Storefront checkout library
//!
//! Drives a food storefront checkout from delivery details through provider
//! selection and payment completion to exactly one finalized order, with a
//! journal that lets the completion page recover after page state is lost.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod models;
pub mod notifications;
pub mod services;
pub mod storage;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::CheckoutError;
use crate::events::EventSender;
use crate::models::ProviderKind;
use crate::notifications::{
    HttpNotificationDispatcher, LogNotificationDispatcher, NotificationDispatcher,
};
use crate::services::providers::{HttpProviderClient, ProviderClient, SandboxProviderClient};
use crate::services::{
    CheckoutContext, CheckoutSession, CompletionGateway, EnvironmentProfiler, OrderFinalizer,
    PricingService, ProviderRegistry, RecoveryScope, RecoveryStore,
};
use crate::storage::{FileStorage, InMemoryStorage, StorageBackend};

pub type SessionMap = DashMap<Uuid, Arc<Mutex<CheckoutSession>>>;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub checkout: Arc<CheckoutContext>,
    pub gateway: Arc<CompletionGateway>,
    pub profiler: Arc<EnvironmentProfiler>,
    pub sessions: Arc<SessionMap>,
    pub storage: Arc<dyn StorageBackend>,
}

impl AppState {
    /// Wires every service from configuration. Providers without an endpoint
    /// run against the sandbox; an unset notification URL logs instead.
    pub fn build(config: AppConfig, events: Option<EventSender>) -> Result<Self, CheckoutError> {
        let storage = build_storage(&config)?;
        let providers = build_providers(&config)?;
        let notifier = build_notifier(&config)?;
        Self::assemble(config, storage, providers, notifier, events)
    }

    /// Wires the services over caller-supplied collaborators.
    pub fn assemble(
        config: AppConfig,
        storage: Arc<dyn StorageBackend>,
        providers: ProviderRegistry,
        notifier: Arc<dyn NotificationDispatcher>,
        events: Option<EventSender>,
    ) -> Result<Self, CheckoutError> {
        let settings = config.checkout_settings();
        let markers = config.restricted_markers();
        let profiler = EnvironmentProfiler::new(markers.as_slice())?;
        let pricing = PricingService::new(settings.delivery_fee);
        let recovery = Arc::new(RecoveryStore::new(
            storage.clone(),
            config.journal_namespace.clone(),
            config.finalized_capacity,
        ));

        let mut finalizer = OrderFinalizer::new(
            recovery.clone(),
            notifier,
            pricing.clone(),
            config.notification_timeout(),
        );
        if let Some(events) = &events {
            finalizer = finalizer.with_events(events.clone());
        }
        let finalizer = Arc::new(finalizer);

        let gateway = CompletionGateway::new(
            recovery.clone(),
            finalizer.clone(),
            providers.clone(),
            settings.clone(),
            RecoveryScope::SessionOnly,
        );
        let checkout = CheckoutContext {
            providers,
            recovery,
            finalizer,
            pricing,
            settings,
            events,
        };

        Ok(Self {
            config,
            checkout: Arc::new(checkout),
            gateway: Arc::new(gateway),
            profiler: Arc::new(profiler),
            sessions: Arc::new(DashMap::new()),
            storage,
        })
    }

    /// Applies lifetime limits to every live session and drops settled ones
    /// once they are past both limits. Sessions busy with a request are
    /// skipped until the next sweep. Returns the number removed.
    pub async fn sweep_sessions(&self, now: DateTime<Utc>) -> usize {
        let settings = &self.checkout.settings;
        let horizon = chrono::Duration::from_std(
            settings.session_max_lifetime + settings.completion_timeout,
        )
        .unwrap_or_else(|_| chrono::Duration::days(1));

        let handles: Vec<(Uuid, Arc<Mutex<CheckoutSession>>)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut stale = Vec::new();
        for (id, handle) in handles {
            let Ok(mut session) = handle.try_lock() else {
                continue;
            };
            if let Err(e) = session.expire_if_stale(now).await {
                warn!(session_id = %id, error = %e, "failed to expire stale session");
            }
            if session.state().is_terminal() && now - session.started_at() > horizon {
                stale.push(id);
            }
        }

        for id in &stale {
            self.sessions.remove(id);
        }
        if !stale.is_empty() {
            info!(removed = stale.len(), "swept settled checkout sessions");
        }
        stale.len()
    }
}

pub fn build_storage(config: &AppConfig) -> Result<Arc<dyn StorageBackend>, CheckoutError> {
    match &config.journal_path {
        Some(path) => {
            let storage = FileStorage::open(path)?;
            info!(path = %storage.path().display(), "checkout journal on disk");
            Ok(Arc::new(storage))
        }
        None => {
            info!("checkout journal in memory");
            Ok(Arc::new(InMemoryStorage::new()))
        }
    }
}

pub fn build_providers(config: &AppConfig) -> Result<ProviderRegistry, CheckoutError> {
    let timeout = config.provider_timeout();
    let client = |kind: ProviderKind| -> Result<Arc<dyn ProviderClient>, CheckoutError> {
        let endpoint = match kind {
            ProviderKind::Card => config.providers.card.as_ref(),
            ProviderKind::RedirectWallet => config.providers.redirect_wallet.as_ref(),
            ProviderKind::BankDebit => config.providers.bank_debit.as_ref(),
        };
        match endpoint {
            Some(endpoint) => Ok(Arc::new(HttpProviderClient::new(endpoint, timeout)?)),
            None => {
                warn!(provider = %kind, "no endpoint configured; using sandbox provider");
                Ok(Arc::new(SandboxProviderClient::new(kind)))
            }
        }
    };
    Ok(ProviderRegistry::standard(
        client(ProviderKind::Card)?,
        client(ProviderKind::RedirectWallet)?,
        client(ProviderKind::BankDebit)?,
    ))
}

pub fn build_notifier(config: &AppConfig) -> Result<Arc<dyn NotificationDispatcher>, CheckoutError> {
    match &config.notification_url {
        Some(url) => {
            let dispatcher = HttpNotificationDispatcher::new(url.clone(), config.notification_timeout())
                .map_err(|e| CheckoutError::Config(format!("notification client: {e}")))?;
            Ok(Arc::new(dispatcher))
        }
        None => {
            info!("notification_url not set; order notifications will be logged");
            Ok(Arc::new(LogNotificationDispatcher))
        }
    }
}
