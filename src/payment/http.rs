//! HTTP client for a payment settlement facilitator

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use super::price::parse_price;
use super::{PaymentClient, PaymentError, PaymentReceipt, PaymentRequest};
use crate::metrics::METRICS;
use async_trait::async_trait;
use moka::future::Cache;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Facilitator connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitatorConfig {
    /// Facilitator base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Bearer key (read from env SPEND_FACILITATOR_API_KEY if not set)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Network payments settle on
    #[serde(default = "default_network")]
    pub network: String,

    /// SOL/USD rate used to convert USD prices to lamports
    #[serde(default = "default_sol_price_usd")]
    pub sol_price_usd: f64,

    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How long a positive verification stays cached, in seconds
    #[serde(default = "default_verify_cache_ttl")]
    pub verify_cache_ttl_secs: u64,

    #[serde(default = "default_verify_cache_size")]
    pub verify_cache_max_size: u64,

    /// Consecutive failures before the breaker opens
    #[serde(default = "default_breaker_failures")]
    pub circuit_breaker_failures: usize,

    #[serde(default = "default_breaker_reset")]
    pub circuit_breaker_reset_secs: u64,
}

fn default_base_url() -> String { "http://localhost:3402".to_string() }
fn default_network() -> String { "devnet".to_string() }
fn default_sol_price_usd() -> f64 { 150.0 }
fn default_timeout_ms() -> u64 { 10_000 }
fn default_verify_cache_ttl() -> u64 { 300 }
fn default_verify_cache_size() -> u64 { 10_000 }
fn default_breaker_failures() -> usize { 5 }
fn default_breaker_reset() -> u64 { 30 }

impl Default for FacilitatorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            network: default_network(),
            sol_price_usd: default_sol_price_usd(),
            timeout_ms: default_timeout_ms(),
            verify_cache_ttl_secs: default_verify_cache_ttl(),
            verify_cache_max_size: default_verify_cache_size(),
            circuit_breaker_failures: default_breaker_failures(),
            circuit_breaker_reset_secs: default_breaker_reset(),
        }
    }
}

impl FacilitatorConfig {
    /// Override settings from environment variables
    pub fn from_env(mut self) -> Self {
        if let Ok(val) = std::env::var("SPEND_FACILITATOR_URL") {
            self.base_url = val;
        }

        if let Ok(val) = std::env::var("SPEND_FACILITATOR_API_KEY") {
            self.api_key = Some(val);
        }

        if let Ok(val) = std::env::var("SPEND_NETWORK") {
            self.network = val;
        }

        if let Ok(val) = std::env::var("SPEND_SOL_PRICE_USD") {
            if let Ok(price) = val.parse() {
                self.sol_price_usd = price;
            }
        }

        if let Ok(val) = std::env::var("SPEND_FACILITATOR_TIMEOUT_MS") {
            if let Ok(timeout) = val.parse() {
                self.timeout_ms = timeout;
            }
        }

        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn verify_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.verify_cache_ttl_secs)
    }

    pub fn breaker_reset_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }
}

/// Wire shape of a settlement request
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PayBody<'a> {
    vendor: &'a str,
    endpoint: &'a str,
    amount: u64,
    network: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<&'a str>,
    idempotency_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    valid: bool,
}

/// Payment client talking to a facilitator over HTTP.
///
/// No retries: a failed payment surfaces to the caller, which decides.
pub struct HttpPaymentClient {
    http: Client,
    config: FacilitatorConfig,
    api_key: Option<SecretString>,
    breaker: CircuitBreaker,
    verified: Cache<String, bool>,
}

impl HttpPaymentClient {
    pub fn new(config: FacilitatorConfig) -> Result<Self, PaymentError> {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| PaymentError::RequestFailed(e.to_string()))?;

        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: config.circuit_breaker_failures,
            reset_timeout: config.breaker_reset_timeout(),
        });

        let verified = Cache::builder()
            .max_capacity(config.verify_cache_max_size)
            .time_to_live(config.verify_cache_ttl())
            .build();

        let api_key = config.api_key.clone().map(SecretString::new);

        Ok(Self {
            http,
            config,
            api_key,
            breaker,
            verified,
        })
    }

    pub fn config(&self) -> &FacilitatorConfig {
        &self.config
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, PaymentError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let mut req = self.http.post(&url).json(body);

        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                PaymentError::Timeout(e.to_string())
            } else {
                PaymentError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(PaymentError::Upstream(format!(
                "Status {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }

    async fn call_pay(
        &self,
        request: &PaymentRequest,
        amount: u64,
        idempotency_key: &str,
    ) -> Result<PaymentReceipt, PaymentError> {
        let body = PayBody {
            vendor: &request.vendor,
            endpoint: &request.endpoint,
            amount,
            network: &self.config.network,
            description: request.description.as_deref(),
            correlation_id: request.correlation_id.as_deref(),
            idempotency_key,
        };

        let response = self.post("pay", &body).await?;
        let mut receipt: PaymentReceipt = response
            .json()
            .await
            .map_err(|e| PaymentError::InvalidResponse(e.to_string()))?;

        if receipt.signature.is_empty() {
            return Err(PaymentError::InvalidResponse(
                "receipt has no signature".to_string(),
            ));
        }
        if receipt.correlation_id.is_empty() {
            receipt.correlation_id = request.correlation_id.clone().unwrap_or_default();
        }
        if receipt.idempotency_key.is_empty() {
            receipt.idempotency_key = idempotency_key.to_string();
        }

        Ok(receipt)
    }
}

#[async_trait]
impl PaymentClient for HttpPaymentClient {
    async fn pay(&self, request: PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        let start = Instant::now();
        let amount = parse_price(&request.price, self.config.sol_price_usd)?;

        if self.breaker.is_open("pay") {
            error!("Circuit breaker is open for pay operation");
            return Err(PaymentError::CircuitOpen("pay".to_string()));
        }

        let idempotency_key = request.effective_idempotency_key();
        debug!(vendor = %request.vendor, amount, "Submitting payment");

        let result = self.call_pay(&request, amount, &idempotency_key).await;
        METRICS.observe_facilitator("pay", start.elapsed());

        match result {
            Ok(receipt) => {
                self.breaker.mark_success("pay");
                info!(
                    vendor = %receipt.vendor,
                    amount = receipt.amount,
                    signature = %receipt.signature,
                    "Payment settled"
                );
                Ok(receipt)
            }
            Err(e) => {
                self.breaker.mark_failure("pay");
                error!(vendor = %request.vendor, "Payment failed: {}", e);
                Err(e)
            }
        }
    }

    async fn verify(&self, receipt: &PaymentReceipt) -> Result<bool, PaymentError> {
        if let Some(valid) = self.verified.get(&receipt.signature).await {
            debug!(signature = %receipt.signature, "Verification cache hit");
            return Ok(valid);
        }

        if self.breaker.is_open("verify") {
            return Err(PaymentError::CircuitOpen("verify".to_string()));
        }

        let start = Instant::now();
        let result = async {
            let response = self.post("verify", receipt).await?;
            response
                .json::<VerifyResponse>()
                .await
                .map_err(|e| PaymentError::InvalidResponse(e.to_string()))
        }
        .await;
        METRICS.observe_facilitator("verify", start.elapsed());

        match result {
            Ok(body) => {
                self.breaker.mark_success("verify");
                // Only settled payments are cached; a negative answer may
                // just mean the transaction has not landed yet.
                if body.valid {
                    self.verified
                        .insert(receipt.signature.clone(), true)
                        .await;
                }
                Ok(body.valid)
            }
            Err(e) => {
                self.breaker.mark_failure("verify");
                Err(e)
            }
        }
    }
}
