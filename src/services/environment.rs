//! Runtime capability profiling.
//!
//! Identity-string matching is a heuristic, not a capability test. It sits
//! behind [`RuntimeProbe`] so a real feature probe can replace it without
//! touching the checkout state machine, and its markers are configuration,
//! not fixed truth.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, warn};

use crate::errors::CheckoutError;
use crate::models::{CompletionStrategy, EnvironmentProfile, ProviderKind};

/// Identity markers of in-app webviews observed to drop callbacks.
pub const DEFAULT_RESTRICTED_MARKERS: &[&str] = &[
    "FBAN",
    "FBAV",
    "Instagram",
    "Line/",
    "Snapchat",
    r"\bwv\b",
    "GSA/",
    r"iPhone.*Mobile/\w+$",
];

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("storage probe failed: {0}")]
    Storage(String),
}

/// What the profiler can learn about the runtime a session runs in.
pub trait RuntimeProbe: Send + Sync {
    /// Runtime identity string (a user agent for browsers).
    fn identity(&self) -> &str;

    /// Attempts a scoped storage open; fails in private or locked-down modes.
    fn probe_storage(&self) -> Result<(), ProbeError>;
}

/// Runtime facts reported by the client when the session loads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedRuntime {
    #[serde(default)]
    pub user_agent: String,
    #[serde(default = "storage_available_default")]
    pub storage_available: bool,
}

fn storage_available_default() -> bool {
    true
}

impl Default for ReportedRuntime {
    fn default() -> Self {
        Self::new("", storage_available_default())
    }
}

impl ReportedRuntime {
    pub fn new(user_agent: impl Into<String>, storage_available: bool) -> Self {
        Self {
            user_agent: user_agent.into(),
            storage_available,
        }
    }
}

impl RuntimeProbe for ReportedRuntime {
    fn identity(&self) -> &str {
        &self.user_agent
    }

    fn probe_storage(&self) -> Result<(), ProbeError> {
        if self.storage_available {
            Ok(())
        } else {
            Err(ProbeError::Storage("client reported storage unavailable".into()))
        }
    }
}

/// Proactive warning for a runtime/provider pairing known to lose callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentWarning {
    pub provider: ProviderKind,
    pub message: String,
    pub recommended_provider: ProviderKind,
}

impl EnvironmentWarning {
    pub fn into_error(self) -> CheckoutError {
        CheckoutError::EnvironmentIncompatibility {
            provider: self.provider,
            message: self.message,
        }
    }
}

struct StrategyRule {
    restricted: bool,
    /// `None` matches whether or not a provider is known.
    redirecting: Option<bool>,
    strategy: CompletionStrategy,
}

/// Evaluated top to bottom; first match wins.
const STRATEGY_TABLE: &[StrategyRule] = &[
    StrategyRule {
        restricted: true,
        redirecting: Some(true),
        strategy: CompletionStrategy::DelayedRedirect,
    },
    StrategyRule {
        restricted: true,
        redirecting: None,
        strategy: CompletionStrategy::ManualContinuation,
    },
    StrategyRule {
        restricted: false,
        redirecting: None,
        strategy: CompletionStrategy::ImmediateCallback,
    },
];

struct IncompatibilityRule {
    provider: ProviderKind,
    needs_unreliable_storage: bool,
    recommended: ProviderKind,
    message: &'static str,
}

/// Only consulted for restricted runtimes.
const INCOMPATIBILITY_TABLE: &[IncompatibilityRule] = &[
    IncompatibilityRule {
        provider: ProviderKind::Card,
        needs_unreliable_storage: false,
        recommended: ProviderKind::RedirectWallet,
        message: "This in-app browser may drop the card confirmation; a wallet payment is more reliable here",
    },
    IncompatibilityRule {
        provider: ProviderKind::RedirectWallet,
        needs_unreliable_storage: true,
        recommended: ProviderKind::BankDebit,
        message: "This browser cannot keep checkout progress while visiting the wallet; bank debit avoids leaving the page",
    },
];

/// Produces an [`EnvironmentProfile`] for each session load.
#[derive(Debug, Clone)]
pub struct EnvironmentProfiler {
    markers: Vec<Regex>,
}

impl EnvironmentProfiler {
    pub fn new<S: AsRef<str>>(markers: &[S]) -> Result<Self, CheckoutError> {
        let markers = markers
            .iter()
            .map(|m| {
                Regex::new(m.as_ref()).map_err(|e| {
                    CheckoutError::Config(format!("invalid runtime marker {:?}: {}", m.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { markers })
    }

    pub fn with_default_markers() -> Self {
        let markers = DEFAULT_RESTRICTED_MARKERS
            .iter()
            .filter_map(|m| Regex::new(m).ok())
            .collect();
        Self { markers }
    }

    /// Profiles the runtime. A failing or panicking storage probe is treated
    /// as a restricted runtime with unreliable storage.
    pub fn profile(&self, probe: &dyn RuntimeProbe) -> EnvironmentProfile {
        let identity = probe.identity();
        let identity_restricted = self.markers.iter().any(|m| m.is_match(identity));

        let storage_reliable =
            match panic::catch_unwind(AssertUnwindSafe(|| probe.probe_storage())) {
                Ok(Ok(())) => true,
                Ok(Err(err)) => {
                    warn!(error = %err, "storage probe failed; assuming restricted runtime");
                    false
                }
                Err(_) => {
                    warn!("storage probe panicked; assuming restricted runtime");
                    false
                }
            };

        let is_restricted_runtime = identity_restricted || !storage_reliable;
        let profile = EnvironmentProfile {
            is_restricted_runtime,
            storage_reliable,
            recommended_strategy: select_strategy(is_restricted_runtime, None),
        };
        debug!(
            restricted = profile.is_restricted_runtime,
            storage_reliable = profile.storage_reliable,
            strategy = %profile.recommended_strategy,
            "runtime profiled"
        );
        profile
    }

    /// Strategy once the customer's provider is known.
    pub fn strategy_for(profile: &EnvironmentProfile, provider: ProviderKind) -> CompletionStrategy {
        select_strategy(profile.is_restricted_runtime, Some(provider.redirects()))
    }

    /// Default suggestion shown in provider selection; the customer may override it.
    pub fn suggested_provider(profile: &EnvironmentProfile) -> ProviderKind {
        if profile.is_restricted_runtime {
            ProviderKind::RedirectWallet
        } else {
            ProviderKind::Card
        }
    }

    pub fn incompatibility(
        profile: &EnvironmentProfile,
        provider: ProviderKind,
    ) -> Option<EnvironmentWarning> {
        if !profile.is_restricted_runtime {
            return None;
        }
        INCOMPATIBILITY_TABLE
            .iter()
            .find(|rule| {
                rule.provider == provider
                    && (!rule.needs_unreliable_storage || !profile.storage_reliable)
            })
            .map(|rule| EnvironmentWarning {
                provider,
                message: rule.message.to_string(),
                recommended_provider: rule.recommended,
            })
    }
}

impl Default for EnvironmentProfiler {
    fn default() -> Self {
        Self::with_default_markers()
    }
}

fn select_strategy(restricted: bool, redirecting: Option<bool>) -> CompletionStrategy {
    STRATEGY_TABLE
        .iter()
        .find(|rule| {
            rule.restricted == restricted
                && match rule.redirecting {
                    None => true,
                    Some(wanted) => redirecting == Some(wanted),
                }
        })
        .map(|rule| rule.strategy)
        .unwrap_or(CompletionStrategy::ManualContinuation)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESKTOP_CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";
    const INSTAGRAM_IOS: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148 Instagram 330.0.0";
    const IOS_WEBVIEW: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Mobile/15E148";
    const IOS_SAFARI: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_4 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Mobile/15E148 Safari/604.1";

    struct PanickingProbe;

    impl RuntimeProbe for PanickingProbe {
        fn identity(&self) -> &str {
            DESKTOP_CHROME
        }

        fn probe_storage(&self) -> Result<(), ProbeError> {
            panic!("indexeddb open threw")
        }
    }

    #[test]
    fn desktop_browser_is_unrestricted() {
        let profile = EnvironmentProfiler::default()
            .profile(&ReportedRuntime::new(DESKTOP_CHROME, true));
        assert_eq!(profile, EnvironmentProfile::unrestricted());
    }

    #[test]
    fn in_app_browsers_are_restricted() {
        let profiler = EnvironmentProfiler::default();
        for ua in [INSTAGRAM_IOS, IOS_WEBVIEW] {
            let profile = profiler.profile(&ReportedRuntime::new(ua, true));
            assert!(profile.is_restricted_runtime, "{ua}");
            assert!(profile.storage_reliable);
            assert_eq!(
                profile.recommended_strategy,
                CompletionStrategy::ManualContinuation
            );
        }
        let safari = profiler.profile(&ReportedRuntime::new(IOS_SAFARI, true));
        assert!(!safari.is_restricted_runtime);
    }

    #[test]
    fn failed_storage_probe_is_restricted() {
        let profile = EnvironmentProfiler::default()
            .profile(&ReportedRuntime::new(DESKTOP_CHROME, false));
        assert!(profile.is_restricted_runtime);
        assert!(!profile.storage_reliable);
    }

    #[test]
    fn panicking_probe_fails_conservative() {
        let profile = EnvironmentProfiler::default().profile(&PanickingProbe);
        assert!(profile.is_restricted_runtime);
        assert!(!profile.storage_reliable);
    }

    #[test]
    fn restricted_redirect_provider_gets_delayed_redirect() {
        let profile = EnvironmentProfiler::default()
            .profile(&ReportedRuntime::new(INSTAGRAM_IOS, true));
        assert_eq!(
            EnvironmentProfiler::strategy_for(&profile, ProviderKind::RedirectWallet),
            CompletionStrategy::DelayedRedirect
        );
        assert_eq!(
            EnvironmentProfiler::strategy_for(&profile, ProviderKind::Card),
            CompletionStrategy::ManualContinuation
        );
    }

    #[test]
    fn unrestricted_runtime_is_immediate_for_every_provider() {
        let profile = EnvironmentProfile::unrestricted();
        for kind in ProviderKind::ALL {
            assert_eq!(
                EnvironmentProfiler::strategy_for(&profile, kind),
                CompletionStrategy::ImmediateCallback
            );
        }
    }

    #[test]
    fn suggestion_prefers_wallet_when_restricted() {
        let restricted = EnvironmentProfiler::default()
            .profile(&ReportedRuntime::new(INSTAGRAM_IOS, true));
        assert_eq!(
            EnvironmentProfiler::suggested_provider(&restricted),
            ProviderKind::RedirectWallet
        );
        assert_eq!(
            EnvironmentProfiler::suggested_provider(&EnvironmentProfile::unrestricted()),
            ProviderKind::Card
        );
    }

    #[test]
    fn incompatibility_warnings() {
        let profiler = EnvironmentProfiler::default();
        let restricted = profiler.profile(&ReportedRuntime::new(INSTAGRAM_IOS, true));
        let warning = EnvironmentProfiler::incompatibility(&restricted, ProviderKind::Card).unwrap();
        assert_eq!(warning.recommended_provider, ProviderKind::RedirectWallet);
        assert!(
            EnvironmentProfiler::incompatibility(&restricted, ProviderKind::RedirectWallet)
                .is_none()
        );

        let no_storage = profiler.profile(&ReportedRuntime::new(INSTAGRAM_IOS, false));
        assert!(
            EnvironmentProfiler::incompatibility(&no_storage, ProviderKind::RedirectWallet)
                .is_some()
        );
        assert!(EnvironmentProfiler::incompatibility(
            &EnvironmentProfile::unrestricted(),
            ProviderKind::Card
        )
        .is_none());
    }

    #[test]
    fn invalid_marker_is_a_config_error() {
        assert!(matches!(
            EnvironmentProfiler::new(&["(unclosed"]),
            Err(CheckoutError::Config(_))
        ));
    }
}
