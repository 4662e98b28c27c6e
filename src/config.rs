use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::services::environment::DEFAULT_RESTRICTED_MARKERS;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "GBP";
const DEFAULT_SETTLE_DELAY_MS: u64 = 1_500;
const MAX_SETTLE_DELAY_MS: u64 = 5_000;
const DEFAULT_SESSION_MAX_LIFETIME_SECS: u64 = 30 * 60;
const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 15 * 60;
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 20;
const DEFAULT_RECOVERY_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_FINALIZED_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_FINALIZED_CAPACITY: usize = 50;
const DEFAULT_JOURNAL_NAMESPACE: &str = "storefront:checkout:v1";
const DEFAULT_COMPLETION_URL: &str = "http://localhost:8080/api/v1/checkout/complete";
const DEFAULT_NOTIFICATION_TIMEOUT_SECS: u64 = 5;
const DEFAULT_PURGE_INTERVAL_SECS: u64 = 300;

/// Connection details for one payment provider's API.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ProviderEndpoint {
    #[validate(url)]
    pub base_url: String,
    pub api_key: String,
}

/// Per-provider endpoints. An unset provider runs against the sandbox.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub card: Option<ProviderEndpoint>,
    #[serde(default)]
    pub redirect_wallet: Option<ProviderEndpoint>,
    #[serde(default)]
    pub bank_debit: Option<ProviderEndpoint>,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// ISO 4217 code all carts are priced in
    #[serde(default = "default_currency")]
    #[validate(custom = "validate_currency")]
    pub currency: String,

    /// Flat delivery tariff; pickup is always free
    #[serde(default = "default_delivery_fee")]
    #[validate(custom = "validate_delivery_fee")]
    pub delivery_fee: Decimal,

    /// Delay before navigating for the delayed-redirect strategy
    #[serde(default = "default_settle_delay_ms")]
    #[validate(custom = "validate_settle_delay")]
    pub settle_delay_ms: u64,

    /// Sessions that have not reached payment by then are abandoned
    #[serde(default = "default_session_max_lifetime_secs")]
    #[validate(custom = "validate_session_lifetime")]
    pub session_max_lifetime_secs: u64,

    /// Sessions awaiting completion longer than this are failed
    #[serde(default = "default_completion_timeout_secs")]
    #[validate(custom = "validate_completion_timeout")]
    pub completion_timeout_secs: u64,

    /// Bound on a single provider API call
    #[serde(default = "default_provider_timeout_secs")]
    #[validate(custom = "validate_provider_timeout")]
    pub provider_timeout_secs: u64,

    /// Journal records older than this are purged
    #[serde(default = "default_recovery_retention_secs")]
    pub recovery_retention_secs: u64,

    /// Finalized intent ids are remembered this long
    #[serde(default = "default_finalized_ttl_secs")]
    pub finalized_ttl_secs: u64,

    /// Maximum number of finalized intent ids kept for idempotency checks
    #[serde(default = "default_finalized_capacity")]
    #[validate(custom = "validate_finalized_capacity")]
    pub finalized_capacity: usize,

    /// Key prefix of every journal entry
    #[serde(default = "default_journal_namespace")]
    #[validate(length(min = 1))]
    pub journal_namespace: String,

    /// Journal file; unset keeps the journal in memory
    #[serde(default)]
    pub journal_path: Option<String>,

    /// How often the purge task sweeps the journal
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Completion page that providers return the customer to
    #[serde(default = "default_completion_url")]
    #[validate(url)]
    pub completion_url: String,

    /// Kitchen notification endpoint; unset logs notifications instead
    #[serde(default)]
    pub notification_url: Option<String>,

    #[serde(default = "default_notification_timeout_secs")]
    pub notification_timeout_secs: u64,

    /// Comma-separated regex markers identifying restricted runtimes
    #[serde(default = "default_restricted_markers")]
    pub restricted_runtime_markers: String,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub providers: ProvidersConfig,
}

/// Checkout timing and pricing knobs handed to the services.
#[derive(Clone, Debug)]
pub struct CheckoutSettings {
    pub currency: String,
    pub delivery_fee: Decimal,
    pub settle_delay: Duration,
    pub session_max_lifetime: Duration,
    pub completion_timeout: Duration,
    pub completion_url: String,
    pub recovery_retention: Duration,
    pub finalized_ttl: Duration,
}

impl Default for CheckoutSettings {
    fn default() -> Self {
        Self {
            currency: DEFAULT_CURRENCY.to_string(),
            delivery_fee: default_delivery_fee(),
            settle_delay: Duration::from_millis(DEFAULT_SETTLE_DELAY_MS),
            session_max_lifetime: Duration::from_secs(DEFAULT_SESSION_MAX_LIFETIME_SECS),
            completion_timeout: Duration::from_secs(DEFAULT_COMPLETION_TIMEOUT_SECS),
            completion_url: DEFAULT_COMPLETION_URL.to_string(),
            recovery_retention: Duration::from_secs(DEFAULT_RECOVERY_RETENTION_SECS),
            finalized_ttl: Duration::from_secs(DEFAULT_FINALIZED_TTL_SECS),
        }
    }
}

impl AppConfig {
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn checkout_settings(&self) -> CheckoutSettings {
        CheckoutSettings {
            currency: self.currency.to_ascii_uppercase(),
            delivery_fee: self.delivery_fee,
            settle_delay: Duration::from_millis(self.settle_delay_ms.min(MAX_SETTLE_DELAY_MS)),
            session_max_lifetime: Duration::from_secs(self.session_max_lifetime_secs),
            completion_timeout: Duration::from_secs(self.completion_timeout_secs),
            completion_url: self.completion_url.clone(),
            recovery_retention: Duration::from_secs(self.recovery_retention_secs),
            finalized_ttl: Duration::from_secs(self.finalized_ttl_secs),
        }
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_secs(self.notification_timeout_secs)
    }

    /// Upper bound on one HTTP request: a payment makes at most six provider
    /// calls and one notification.
    pub fn request_timeout(&self) -> Duration {
        self.provider_timeout() * 6 + self.notification_timeout()
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }

    /// Restricted-runtime markers, blank entries dropped.
    pub fn restricted_markers(&self) -> Vec<String> {
        self.restricted_runtime_markers
            .split(',')
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}
fn default_delivery_fee() -> Decimal {
    dec!(3.50)
}
fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}
fn default_session_max_lifetime_secs() -> u64 {
    DEFAULT_SESSION_MAX_LIFETIME_SECS
}
fn default_completion_timeout_secs() -> u64 {
    DEFAULT_COMPLETION_TIMEOUT_SECS
}
fn default_provider_timeout_secs() -> u64 {
    DEFAULT_PROVIDER_TIMEOUT_SECS
}
fn default_recovery_retention_secs() -> u64 {
    DEFAULT_RECOVERY_RETENTION_SECS
}
fn default_finalized_ttl_secs() -> u64 {
    DEFAULT_FINALIZED_TTL_SECS
}
fn default_finalized_capacity() -> usize {
    DEFAULT_FINALIZED_CAPACITY
}
fn default_journal_namespace() -> String {
    DEFAULT_JOURNAL_NAMESPACE.to_string()
}
fn default_purge_interval_secs() -> u64 {
    DEFAULT_PURGE_INTERVAL_SECS
}
fn default_completion_url() -> String {
    DEFAULT_COMPLETION_URL.to_string()
}
fn default_notification_timeout_secs() -> u64 {
    DEFAULT_NOTIFICATION_TIMEOUT_SECS
}
fn default_restricted_markers() -> String {
    DEFAULT_RESTRICTED_MARKERS.join(",")
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

fn validate_delivery_fee(fee: &Decimal) -> Result<(), ValidationError> {
    if fee.is_sign_negative() {
        let mut err = ValidationError::new("delivery_fee");
        err.message = Some("delivery_fee cannot be negative".into());
        return Err(err);
    }
    Ok(())
}

fn validate_settle_delay(delay_ms: u64) -> Result<(), ValidationError> {
    if delay_ms > MAX_SETTLE_DELAY_MS {
        let mut err = ValidationError::new("settle_delay_ms");
        err.message = Some("settle_delay_ms must not exceed 5000".into());
        return Err(err);
    }
    Ok(())
}

fn validate_session_lifetime(secs: u64) -> Result<(), ValidationError> {
    if secs < 60 {
        let mut err = ValidationError::new("session_max_lifetime_secs");
        err.message = Some("session_max_lifetime_secs must be at least 60".into());
        return Err(err);
    }
    Ok(())
}

fn validate_completion_timeout(secs: u64) -> Result<(), ValidationError> {
    if secs < 30 {
        let mut err = ValidationError::new("completion_timeout_secs");
        err.message = Some("completion_timeout_secs must be at least 30".into());
        return Err(err);
    }
    Ok(())
}

fn validate_provider_timeout(secs: u64) -> Result<(), ValidationError> {
    if secs == 0 || secs > 120 {
        let mut err = ValidationError::new("provider_timeout_secs");
        err.message = Some("provider_timeout_secs must be between 1 and 120".into());
        return Err(err);
    }
    Ok(())
}

fn validate_finalized_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("finalized_capacity");
        err.message = Some("finalized_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = with_defaults(Config::builder())?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    from_config(config)
}

fn with_defaults(
    builder: config::ConfigBuilder<config::builder::DefaultState>,
) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
    builder
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)
}

/// Builds a configuration from built-in defaults overlaid with a TOML
/// document. Used for embedding and tests; no files or environment are read.
pub fn config_from_toml(toml: &str) -> Result<AppConfig, AppConfigError> {
    let config = with_defaults(Config::builder())?
        .add_source(File::from_str(toml, config::FileFormat::Toml))
        .build()?;
    from_config(config)
}

/// Deserializes and validates an already layered configuration.
pub fn from_config(config: Config) -> Result<AppConfig, AppConfigError> {
    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
