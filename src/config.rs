//! Runtime configuration
//!
//! Layered lowest to highest: built-in defaults, an optional TOML file
//! (path argument or `SPEND_CONFIG`), then `SPEND__SECTION__KEY` environment
//! variables. A `.env` file is loaded first if present.
//!
//! The payment policy itself is a separate camelCase JSON document referenced
//! by `policy_path`.

use crate::error::{Result, SpendError};
use crate::payment::FacilitatorConfig;
use crate::policy::PaymentPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpendConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Which payment client sessions use
    #[serde(default)]
    pub payment_backend: PaymentBackend,

    #[serde(default)]
    pub payment: FacilitatorConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub server: ServerConfig,

    /// Path to the payment policy JSON document
    #[serde(default)]
    pub policy_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentBackend {
    /// Settle through the HTTP facilitator
    #[default]
    Facilitator,
    /// Settle in memory
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Keep in-flight reservations across a window reset
    #[serde(default)]
    pub carry_reservations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Also write every event to the log
    #[serde(default = "default_true")]
    pub log_events: bool,

    /// Buffer of the live event stream
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_broadcast_capacity() -> usize {
    1024
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_events: default_true(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl SpendConfig {
    /// Load from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> std::result::Result<Self, config::ConfigError> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&SpendConfig::default())?);

        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("SPEND_CONFIG").ok());
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(&path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SPEND")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: SpendConfig = builder.build()?.try_deserialize()?;
        loaded.payment = loaded.payment.from_env();
        Ok(loaded)
    }

    /// Parse a TOML document over the defaults, ignoring the environment
    pub fn from_toml_str(toml: &str) -> std::result::Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Config::try_from(&SpendConfig::default())?)
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Read the policy document named by `policy_path`, if any
    pub fn load_policy(&self) -> Result<Option<PaymentPolicy>> {
        match &self.policy_path {
            Some(path) => read_policy(path).map(Some),
            None => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.payment.sol_price_usd.is_finite() || self.payment.sol_price_usd <= 0.0 {
            return Err(SpendError::Config(format!(
                "payment.sol_price_usd must be positive, got {}",
                self.payment.sol_price_usd
            )));
        }
        if self.payment_backend == PaymentBackend::Facilitator && self.payment.base_url.is_empty() {
            return Err(SpendError::Config(
                "payment.base_url is required for the facilitator backend".to_string(),
            ));
        }
        if self.telemetry.broadcast_capacity == 0 {
            return Err(SpendError::Config(
                "telemetry.broadcast_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Read and validate a policy document from disk
pub fn read_policy(path: impl AsRef<Path>) -> Result<PaymentPolicy> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|e| {
        SpendError::Config(format!("cannot read policy {}: {}", path.display(), e))
    })?;
    PaymentPolicy::from_json_str(&json)
}
