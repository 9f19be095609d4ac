use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, InMemoryKillSwitch, KillSwitch, RedisKillSwitch,
};
use crate::models::{biller::BillerError, Biller, BillerName};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const CONFIG_DIR: &str = "config";
const DEFAULT_KILL_SWITCH_BACKEND: &str = "in-memory";
const DEFAULT_KILL_SWITCH_NAMESPACE: &str = "purchase-gateway:kill-switch";
const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Circuit breaker settings shared by every guarded command
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_rolling_window_size")]
    #[validate(range(min = 1))]
    pub rolling_window_size: usize,

    /// Calls needed in the window before the breaker may trip
    #[serde(default = "default_request_volume_threshold")]
    #[validate(range(min = 1))]
    pub request_volume_threshold: u32,

    #[serde(default = "default_error_threshold_percentage")]
    #[validate(range(min = 1, max = 100))]
    pub error_threshold_percentage: u8,

    #[serde(default = "default_sleep_window_ms")]
    #[validate(range(min = 1))]
    pub sleep_window_ms: u64,

    #[serde(default = "default_success_threshold")]
    #[validate(range(min = 1))]
    pub success_threshold: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            rolling_window_size: default_rolling_window_size(),
            request_volume_threshold: default_request_volume_threshold(),
            error_threshold_percentage: default_error_threshold_percentage(),
            sleep_window_ms: default_sleep_window_ms(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl From<&CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitBreakerSettings) -> Self {
        Self {
            rolling_window_size: settings.rolling_window_size,
            request_volume_threshold: settings.request_volume_threshold,
            error_threshold_percentage: settings.error_threshold_percentage,
            sleep_window: Duration::from_millis(settings.sleep_window_ms),
            success_threshold: settings.success_threshold,
        }
    }
}

/// One step of the default cascade
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CascadeEntry {
    pub biller: BillerName,
    /// Falls back to the biller's own default when absent
    #[serde(default)]
    pub max_submits: Option<u32>,
}

impl CascadeEntry {
    pub fn to_biller(&self) -> Result<Biller, BillerError> {
        match self.max_submits {
            Some(max_submits) => Biller::new(self.biller, max_submits),
            None => Ok(Biller::with_defaults(self.biller)),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Application environment (development, staging, production)
    #[validate(length(min = 1))]
    pub environment: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Capacity of the domain event channel
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    #[serde(default = "default_fraud_timeout_ms")]
    #[validate(range(min = 1))]
    pub fraud_timeout_ms: u64,

    #[serde(default = "default_payment_template_timeout_ms")]
    #[validate(range(min = 1))]
    pub payment_template_timeout_ms: u64,

    #[serde(default = "default_bin_routing_timeout_ms")]
    #[validate(range(min = 1))]
    pub bin_routing_timeout_ms: u64,

    #[serde(default = "default_biller_timeout_ms")]
    #[validate(range(min = 1))]
    pub biller_timeout_ms: u64,

    #[serde(default)]
    #[validate]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Where kill switch flags live: "in-memory" or "redis"
    #[serde(default = "default_kill_switch_backend")]
    #[validate(custom = "validate_kill_switch_backend")]
    pub kill_switch_backend: String,

    /// Redis connection URL for the kill switch
    pub redis_url: String,

    #[serde(default = "default_kill_switch_namespace")]
    #[validate(length(min = 1))]
    pub kill_switch_namespace: String,

    /// Ceiling on one kill switch lookup, in milliseconds
    #[serde(default = "default_kill_switch_lookup_timeout_ms")]
    #[validate(range(min = 1))]
    pub kill_switch_lookup_timeout_ms: u64,

    #[validate(url)]
    pub fraud_service_url: String,

    #[validate(url)]
    pub payment_template_service_url: String,

    #[validate(url)]
    pub bin_routing_service_url: String,

    /// Billers tried in order when a purchase does not bring its own cascade
    #[serde(default = "default_cascade")]
    pub default_cascade: Vec<CascadeEntry>,
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn fraud_timeout(&self) -> Duration {
        Duration::from_millis(self.fraud_timeout_ms)
    }

    pub fn payment_template_timeout(&self) -> Duration {
        Duration::from_millis(self.payment_template_timeout_ms)
    }

    pub fn bin_routing_timeout(&self) -> Duration {
        Duration::from_millis(self.bin_routing_timeout_ms)
    }

    pub fn biller_timeout(&self) -> Duration {
        Duration::from_millis(self.biller_timeout_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from(&self.circuit_breaker)
    }

    /// The configured cascade as billers, in order.
    pub fn cascade_billers(&self) -> Vec<Biller> {
        self.default_cascade
            .iter()
            .filter_map(|entry| entry.to_biller().ok())
            .collect()
    }

    pub fn kill_switch(&self) -> Result<Arc<dyn KillSwitch>, redis::RedisError> {
        if self.kill_switch_backend.eq_ignore_ascii_case("redis") {
            let kill_switch = RedisKillSwitch::new(&self.redis_url, self.kill_switch_namespace.clone())?
                .with_lookup_timeout(Duration::from_millis(self.kill_switch_lookup_timeout_ms));
            Ok(Arc::new(kill_switch))
        } else {
            Ok(Arc::new(InMemoryKillSwitch::new()))
        }
    }

    pub fn breaker_registry(&self) -> Result<CircuitBreakerRegistry, redis::RedisError> {
        Ok(CircuitBreakerRegistry::new(
            self.breaker_config(),
            self.kill_switch()?,
        ))
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.default_cascade.is_empty() {
            let mut err = ValidationError::new("default_cascade_empty");
            err.message = Some("default_cascade needs at least one biller".into());
            errors.add("default_cascade", err);
        }

        if let Some(entry) = self
            .default_cascade
            .iter()
            .find(|entry| entry.biller == BillerName::Unknown || entry.max_submits == Some(0))
        {
            let mut err = ValidationError::new("default_cascade_entry");
            err.message = Some(
                format!(
                    "cascade entry for {} needs a known biller and a positive max_submits",
                    entry.biller
                )
                .into(),
            );
            errors.add("default_cascade", err);
        }

        if self.circuit_breaker.request_volume_threshold as usize
            > self.circuit_breaker.rolling_window_size
        {
            let mut err = ValidationError::new("request_volume_threshold");
            err.message = Some(
                "circuit_breaker.request_volume_threshold cannot exceed rolling_window_size".into(),
            );
            errors.add("circuit_breaker", err);
        }

        if errors.errors().is_empty() {
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

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_event_channel_capacity() -> usize {
    DEFAULT_EVENT_CHANNEL_CAPACITY
}

fn default_fraud_timeout_ms() -> u64 {
    1500
}

fn default_payment_template_timeout_ms() -> u64 {
    2000
}

fn default_bin_routing_timeout_ms() -> u64 {
    1000
}

fn default_biller_timeout_ms() -> u64 {
    30_000
}

fn default_rolling_window_size() -> usize {
    20
}

fn default_request_volume_threshold() -> u32 {
    10
}

fn default_error_threshold_percentage() -> u8 {
    50
}

fn default_sleep_window_ms() -> u64 {
    5000
}

fn default_success_threshold() -> u32 {
    2
}

fn default_kill_switch_backend() -> String {
    DEFAULT_KILL_SWITCH_BACKEND.to_string()
}

fn default_kill_switch_namespace() -> String {
    DEFAULT_KILL_SWITCH_NAMESPACE.to_string()
}

fn default_kill_switch_lookup_timeout_ms() -> u64 {
    100
}

fn default_cascade() -> Vec<CascadeEntry> {
    vec![
        CascadeEntry {
            biller: BillerName::Rocketgate,
            max_submits: None,
        },
        CascadeEntry {
            biller: BillerName::Netbilling,
            max_submits: None,
        },
    ]
}

fn validate_kill_switch_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "redis" => Ok(()),
        _ => {
            let mut err = ValidationError::new("kill_switch_backend");
            err.message = Some("Must be one of: in-memory, redis".into());
            Err(err)
        }
    }
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

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("purchase_gateway={}", level);
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
    load_config_from(Path::new(CONFIG_DIR), &run_env)
}

/// Same layering as [`load_config`] with an explicit config directory and profile.
pub fn load_config_from(config_dir: &Path, run_env: &str) -> Result<AppConfig, AppConfigError> {
    info!("Loading configuration for environment: {}", run_env);

    if !config_dir.exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir.display()
        );
    }

    let config = Config::builder()
        .set_default("environment", run_env)?
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("fraud_service_url", "http://localhost:8081")?
        .set_default("payment_template_service_url", "http://localhost:8082")?
        .set_default("bin_routing_service_url", "http://localhost:8083")?
        .add_source(File::from(config_dir.join("default")).required(false))
        .add_source(File::from(config_dir.join(run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

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
