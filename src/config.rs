use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_ADMISSION_NAMESPACE: &str = "petfolio:rl";
const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;
const DEFAULT_BURST_WINDOW_SECS: u64 = 60;
const DEFAULT_GEO_MULTIPLIER: f64 = 0.5;
const DEFAULT_PRIMARY_MARKETS: &str = "US,CA,GB,IE,AU,NZ";

/// Admission-control configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AdmissionConfig {
    /// Use the Redis-backed counter store (in-memory otherwise)
    #[serde(default)]
    pub use_redis: bool,

    /// Namespace prefix for counter keys
    #[serde(default = "default_admission_namespace")]
    pub namespace: String,

    /// Per-operation timeout for counter store round-trips (milliseconds).
    /// A timed-out check fails open immediately; there is no retry on the
    /// request path.
    #[serde(default = "default_store_timeout_ms")]
    #[validate(range(min = 10, max = 5000))]
    pub store_timeout_ms: u64,

    /// Emit X-RateLimit-* / RateLimit-* response headers
    #[serde(default = "default_true_bool")]
    pub enable_headers: bool,

    /// Burst window length (seconds)
    #[serde(default = "default_burst_window_secs")]
    #[validate(range(min = 1))]
    pub burst_window_secs: u64,

    /// Per-tier burst ceilings for the 60s window
    #[serde(default = "default_burst_anonymous")]
    #[validate(range(min = 1))]
    pub burst_anonymous: u32,
    #[serde(default = "default_burst_free")]
    #[validate(range(min = 1))]
    pub burst_free: u32,
    #[serde(default = "default_burst_premium")]
    #[validate(range(min = 1))]
    pub burst_premium: u32,
    #[serde(default = "default_burst_family")]
    #[validate(range(min = 1))]
    pub burst_family: u32,

    /// Comma-separated country codes that keep the full quota limit
    #[serde(default = "default_primary_markets")]
    pub primary_markets: String,

    /// Quota multiplier for callers outside the primary markets, in (0, 1]
    #[serde(default = "default_geo_multiplier")]
    #[validate(custom = "validate_multiplier")]
    pub default_geo_multiplier: f64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            use_redis: false,
            namespace: default_admission_namespace(),
            store_timeout_ms: default_store_timeout_ms(),
            enable_headers: true,
            burst_window_secs: default_burst_window_secs(),
            burst_anonymous: default_burst_anonymous(),
            burst_free: default_burst_free(),
            burst_premium: default_burst_premium(),
            burst_family: default_burst_family(),
            primary_markets: default_primary_markets(),
            default_geo_multiplier: default_geo_multiplier(),
        }
    }
}

impl AdmissionConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_secs(self.burst_window_secs)
    }

    pub fn primary_market_codes(&self) -> Vec<String> {
        self.primary_markets
            .split(',')
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Redis connection URL
    pub redis_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Admission-control configuration
    #[serde(default)]
    #[validate]
    pub admission: AdmissionConfig,
}

impl AppConfig {
    pub fn new(redis_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            redis_url,
            host,
            port,
            environment,
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            cors_allowed_origins: None,
            admission: AdmissionConfig::default(),
        }
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn is_development(&self) -> bool {
        matches!(self.environment.as_str(), "development" | "dev" | "test")
    }
}

fn default_admission_namespace() -> String {
    DEFAULT_ADMISSION_NAMESPACE.to_string()
}

fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}

fn default_burst_window_secs() -> u64 {
    DEFAULT_BURST_WINDOW_SECS
}

fn default_burst_anonymous() -> u32 {
    15
}

fn default_burst_free() -> u32 {
    30
}

fn default_burst_premium() -> u32 {
    60
}

fn default_burst_family() -> u32 {
    90
}

fn default_primary_markets() -> String {
    DEFAULT_PRIMARY_MARKETS.to_string()
}

fn default_geo_multiplier() -> f64 {
    DEFAULT_GEO_MULTIPLIER
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_true_bool() -> bool {
    true
}

fn validate_multiplier(value: f64) -> Result<(), ValidationError> {
    if value <= 0.0 || value > 1.0 {
        let mut err = ValidationError::new("default_geo_multiplier");
        err.message = Some("geo multiplier must be in (0, 1]".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("petfolio_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
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

    let config = Config::builder()
        .set_default("redis_url", "redis://localhost:6379")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
