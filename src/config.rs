use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_GATEWAY_URL: &str = "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html";

/// How callback parameters are re-encoded before the signature is recomputed.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallbackEncoding {
    /// Same form encoding as the outbound request (space becomes `+`)
    #[default]
    Form,
    /// Values are concatenated exactly as received, without re-encoding
    Raw,
}

/// Payment gateway connection and protocol settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentGatewayConfig {
    /// Provider label stored on payment rows
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Merchant terminal code issued by the gateway
    #[serde(default)]
    pub tmn_code: String,

    /// Shared HMAC secret
    #[serde(default)]
    pub hash_secret: String,

    #[validate(url)]
    #[serde(default = "default_gateway_url")]
    pub payment_url: String,

    /// Where the gateway sends the customer's browser after payment
    #[validate(url)]
    #[serde(default = "default_return_url")]
    pub return_url: String,

    #[serde(default = "default_gateway_version")]
    pub version: String,

    #[serde(default = "default_gateway_command")]
    pub command: String,

    #[serde(default = "default_gateway_currency")]
    pub currency: String,

    #[serde(default = "default_gateway_locale")]
    pub locale: String,

    #[serde(default = "default_order_type")]
    pub order_type: String,

    /// Payment link lifetime sent as the expiry timestamp
    #[validate(range(min = 1, max = 1440))]
    #[serde(default = "default_expire_minutes")]
    pub expire_minutes: i64,

    /// Factor converting order amounts into the gateway's smallest unit
    #[validate(range(min = 1))]
    #[serde(default = "default_amount_multiplier")]
    pub amount_multiplier: i64,

    /// Offset applied when formatting gateway timestamps (GMT+7 by default)
    #[serde(default = "default_timezone_offset_minutes")]
    pub timezone_offset_minutes: i32,

    #[serde(default = "default_success_code")]
    pub success_response_code: String,

    #[serde(default)]
    pub callback_encoding: CallbackEncoding,
}

impl Default for PaymentGatewayConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            tmn_code: String::new(),
            hash_secret: String::new(),
            payment_url: default_gateway_url(),
            return_url: default_return_url(),
            version: default_gateway_version(),
            command: default_gateway_command(),
            currency: default_gateway_currency(),
            locale: default_gateway_locale(),
            order_type: default_order_type(),
            expire_minutes: default_expire_minutes(),
            amount_multiplier: default_amount_multiplier(),
            timezone_offset_minutes: default_timezone_offset_minutes(),
            success_response_code: default_success_code(),
            callback_encoding: CallbackEncoding::default(),
        }
    }
}

impl PaymentGatewayConfig {
    pub fn is_configured(&self) -> bool {
        !self.tmn_code.trim().is_empty() && !self.hash_secret.trim().is_empty()
    }
}

/// Outbound status-change notifications
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct NotifierConfig {
    /// Webhook receiving status changes; log-only when unset
    #[validate(url)]
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Secret used to sign webhook bodies
    #[serde(default)]
    pub webhook_secret: Option<String>,

    #[validate(range(min = 1, max = 10))]
    #[serde(default = "default_notifier_retries")]
    pub max_retries: u32,

    #[serde(default = "default_notifier_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_secret: None,
            max_retries: default_notifier_retries(),
            timeout_secs: default_notifier_timeout_secs(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    #[validate(length(min = 1))]
    pub environment: String,

    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// HS256 secret shared with the token issuer
    #[validate(length(min = 32))]
    pub jwt_secret: String,

    #[serde(default)]
    pub jwt_issuer: Option<String>,

    #[serde(default)]
    pub jwt_audience: Option<String>,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default)]
    pub cors_allow_any_origin: bool,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,

    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Storefront base URL for post-payment redirects
    #[validate(url)]
    #[serde(default = "default_frontend_url")]
    pub frontend_url: String,

    #[validate]
    #[serde(default)]
    pub payment: PaymentGatewayConfig,

    #[validate]
    #[serde(default)]
    pub notifier: NotifierConfig,
}

impl AppConfig {
    /// Creates a configuration with every optional setting defaulted
    pub fn new(database_url: String, jwt_secret: String, environment: String) -> Self {
        Self {
            database_url,
            host: "0.0.0.0".to_string(),
            port: default_port(),
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            jwt_secret,
            jwt_issuer: None,
            jwt_audience: None,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            frontend_url: default_frontend_url(),
            payment: PaymentGatewayConfig::default(),
            notifier: NotifierConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    pub fn should_allow_permissive_cors(&self) -> bool {
        self.cors_allow_any_origin || self.is_development()
    }

    /// Checks that cannot be expressed as field attributes
    pub fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        if !self.is_development() && !self.payment.is_configured() {
            let mut err = ValidationError::new("payment");
            err.message = Some("payment.tmn_code and payment.hash_secret are required".into());
            errors.add("payment", err);
        }

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections cannot exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}
fn default_event_channel_capacity() -> usize {
    1024
}
fn default_frontend_url() -> String {
    "http://localhost:3000".to_string()
}
fn default_provider() -> String {
    "VNPAY".to_string()
}
fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}
fn default_return_url() -> String {
    "http://localhost:8080/api/v1/payments/vnpay/return".to_string()
}
fn default_gateway_version() -> String {
    "2.1.0".to_string()
}
fn default_gateway_command() -> String {
    "pay".to_string()
}
fn default_gateway_currency() -> String {
    "VND".to_string()
}
fn default_gateway_locale() -> String {
    "vn".to_string()
}
fn default_order_type() -> String {
    "other".to_string()
}
fn default_expire_minutes() -> i64 {
    15
}
fn default_amount_multiplier() -> i64 {
    100
}
fn default_timezone_offset_minutes() -> i32 {
    7 * 60
}
fn default_success_code() -> String {
    "00".to_string()
}
fn default_notifier_retries() -> u32 {
    3
}
fn default_notifier_timeout_secs() -> u64 {
    10
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

    // jwt_secret has no default on purpose
    let config = Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to the token issuer's shared secret.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured".into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new(
            "sqlite::memory:".into(),
            "a-test-secret-that-is-at-least-32-characters".into(),
            "production".into(),
        )
    }

    #[test]
    fn defaults_follow_gateway_protocol() {
        let cfg = base_config();
        assert_eq!(cfg.payment.version, "2.1.0");
        assert_eq!(cfg.payment.expire_minutes, 15);
        assert_eq!(cfg.payment.amount_multiplier, 100);
        assert_eq!(cfg.payment.callback_encoding, CallbackEncoding::Form);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn non_dev_requires_gateway_credentials() {
        let mut cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.payment.tmn_code = "TESTCODE".into();
        cfg.payment.hash_secret = "SECRET".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn development_tolerates_missing_gateway() {
        let mut cfg = base_config();
        cfg.environment = "development".into();
        assert!(cfg.validate_additional_constraints().is_ok());
        assert!(cfg.should_allow_permissive_cors());
    }

    #[test]
    fn short_jwt_secret_is_rejected() {
        let mut cfg = base_config();
        cfg.jwt_secret = "short".into();
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("jwt_secret"));
    }

    #[test]
    fn callback_encoding_parses_lowercase() {
        let parsed: CallbackEncoding = serde_json::from_str("\"raw\"").unwrap();
        assert_eq!(parsed, CallbackEncoding::Raw);
    }
}
