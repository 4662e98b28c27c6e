use serde::{Deserialize, Serialize};
use strum::Display;

/// How the session completes once a payment intent exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompletionStrategy {
    /// Await confirmation in-process and finalize directly.
    ImmediateCallback,
    /// Navigate after a bounded settle delay and let the completion page finish.
    DelayedRedirect,
    /// Never auto-navigate; the customer presses "Continue".
    ManualContinuation,
}

/// Capabilities of the runtime a session was loaded in. Recomputed on every
/// load and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    pub is_restricted_runtime: bool,
    pub storage_reliable: bool,
    pub recommended_strategy: CompletionStrategy,
}

impl EnvironmentProfile {
    pub fn unrestricted() -> Self {
        Self {
            is_restricted_runtime: false,
            storage_reliable: true,
            recommended_strategy: CompletionStrategy::ImmediateCallback,
        }
    }
}
