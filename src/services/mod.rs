//! Checkout services, leaves first: runtime profiling, provider adapters,
//! the recovery journal, pricing, the session state machine, finalization
//! and the completion page.

pub mod checkout_session;
pub mod completion_gateway;
pub mod environment;
pub mod order_finalizer;
pub mod pricing;
pub mod providers;
pub mod recovery_store;

pub use checkout_session::{
    CheckoutContext, CheckoutSession, CompletionOutcome, Continuation, ContinuationMode,
    Navigation, ProviderChoice, SelectionPrompt, SessionSnapshot, SessionState,
};
pub use completion_gateway::{
    AdvisoryReceipt, CompletionGateway, CompletionParams, CompletionView, RecoveryScope,
};
pub use environment::{EnvironmentProfiler, EnvironmentWarning, ReportedRuntime, RuntimeProbe};
pub use order_finalizer::OrderFinalizer;
pub use pricing::{FulfillmentQuote, PricingService};
pub use providers::{PaymentProviderAdapter, ProviderRegistry};
pub use recovery_store::{PurgeReport, RecoveryStore};
