#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use storefront_checkout::{
    config::CheckoutSettings,
    models::{Cart, DeliveryDetails, EnvironmentProfile, LineItem, PaymentDetails, ProviderKind},
    notifications::{NotificationDispatcher, NotificationError, OrderNotification},
    services::{
        providers::SandboxProviderClient, CheckoutContext, CheckoutSession, CompletionGateway,
        EnvironmentProfiler, OrderFinalizer, PricingService, ProviderRegistry, RecoveryScope,
        RecoveryStore, ReportedRuntime,
    },
    storage::{InMemoryStorage, StorageBackend},
};

pub const NAMESPACE: &str = "test:checkout";
pub const IN_APP_UA: &str =
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15 [FBAN/FBIOS;FBAV/440.0]";
pub const DESKTOP_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// Notification endpoint double that records what it was sent.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OrderNotification>>,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<OrderNotification> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationDispatcher for RecordingNotifier {
    async fn dispatch(&self, notification: &OrderNotification) -> Result<(), NotificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotificationError::Internal("kitchen endpoint down".into()));
        }
        self.sent
            .lock()
            .map_err(|_| NotificationError::Internal("poisoned".into()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Checkout services wired over sandbox providers and in-memory storage.
pub struct Harness {
    pub storage: Arc<InMemoryStorage>,
    pub recovery: Arc<RecoveryStore>,
    pub finalizer: Arc<OrderFinalizer>,
    pub notifier: Arc<RecordingNotifier>,
    pub card: Arc<SandboxProviderClient>,
    pub wallet: Arc<SandboxProviderClient>,
    pub bank: Arc<SandboxProviderClient>,
    pub ctx: Arc<CheckoutContext>,
    pub profiler: EnvironmentProfiler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(CheckoutSettings::default())
    }

    pub fn with_settings(settings: CheckoutSettings) -> Self {
        Self::build(settings, None)
    }

    /// Every sandbox call takes `latency` to answer.
    pub fn with_latency(settings: CheckoutSettings, latency: Duration) -> Self {
        Self::build(settings, Some(latency))
    }

    fn build(settings: CheckoutSettings, latency: Option<Duration>) -> Self {
        let sandbox = |kind| {
            let client = SandboxProviderClient::new(kind);
            Arc::new(match latency {
                Some(latency) => client.with_latency(latency),
                None => client,
            })
        };
        let card = sandbox(ProviderKind::Card);
        let wallet = sandbox(ProviderKind::RedirectWallet);
        let bank = sandbox(ProviderKind::BankDebit);

        let storage = Arc::new(InMemoryStorage::new());
        let backend: Arc<dyn StorageBackend> = storage.clone();
        let recovery = Arc::new(RecoveryStore::new(backend, NAMESPACE, 50));
        let notifier = Arc::new(RecordingNotifier::default());
        let pricing = PricingService::new(settings.delivery_fee);
        let finalizer = Arc::new(OrderFinalizer::new(
            recovery.clone(),
            notifier.clone(),
            pricing.clone(),
            Duration::from_secs(2),
        ));
        let providers = ProviderRegistry::standard(card.clone(), wallet.clone(), bank.clone());
        let ctx = Arc::new(CheckoutContext {
            providers,
            recovery: recovery.clone(),
            finalizer: finalizer.clone(),
            pricing,
            settings,
            events: None,
        });

        Self {
            storage,
            recovery,
            finalizer,
            notifier,
            card,
            wallet,
            bank,
            ctx,
            profiler: EnvironmentProfiler::with_default_markers(),
        }
    }

    pub fn gateway(&self, scope: RecoveryScope) -> CompletionGateway {
        CompletionGateway::new(
            self.recovery.clone(),
            self.finalizer.clone(),
            self.ctx.providers.clone(),
            self.ctx.settings.clone(),
            scope,
        )
    }

    pub fn profile(&self, user_agent: &str) -> EnvironmentProfile {
        self.profiler.profile(&ReportedRuntime::new(user_agent, true))
    }

    pub async fn start(&self, cart: Cart) -> CheckoutSession {
        CheckoutSession::start(self.ctx.clone(), cart, EnvironmentProfile::unrestricted())
            .await
            .expect("session starts")
    }

    /// A session with pickup details submitted and `kind` selected.
    pub async fn ready_to_pay(&self, kind: ProviderKind) -> CheckoutSession {
        let mut session = self.start(sample_cart()).await;
        session
            .submit_details(pickup_details())
            .await
            .expect("details accepted");
        session.select_provider(kind).await.expect("provider selected");
        session
    }

    pub async fn journal_len(&self) -> usize {
        self.storage
            .keys(&format!("{NAMESPACE}:active:"))
            .await
            .map(|keys| keys.len())
            .unwrap_or(0)
    }
}

/// Two lines totalling £21.98.
pub fn sample_cart() -> Cart {
    Cart::new(vec![
        LineItem::new("jollof-rice", "Jollof Rice", dec!(8.99), 2),
        LineItem::new("puff-puff", "Puff Puff", dec!(4.00), 1).with_size("regular"),
    ])
}

pub fn pickup_details() -> DeliveryDetails {
    DeliveryDetails::pickup("Ada Obi", "ada@example.com", "+44 7700 900123")
}

pub fn delivery_details() -> DeliveryDetails {
    DeliveryDetails::delivery(
        "Ada Obi",
        "ada@example.com",
        "+44 7700 900123",
        "12 Market Street",
        "Leeds",
        "LS1 6DT",
    )
}

pub fn card_payment() -> PaymentDetails {
    PaymentDetails::Card {
        token: "tok_visa".into(),
    }
}

pub fn bank_payment() -> PaymentDetails {
    PaymentDetails::BankDebit {
        account_holder: "Ada Obi".into(),
        sort_code: "12-34-56".into(),
        account_number: "12345678".into(),
    }
}

pub fn payment_for(kind: ProviderKind) -> PaymentDetails {
    match kind {
        ProviderKind::Card => card_payment(),
        ProviderKind::RedirectWallet => PaymentDetails::Wallet,
        ProviderKind::BankDebit => bank_payment(),
    }
}
