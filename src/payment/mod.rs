//! Payment client boundary
//!
//! The core never settles payments itself; it hands a [`PaymentRequest`] to a
//! [`PaymentClient`] and gets back a [`PaymentReceipt`] proving settlement.

pub mod circuit_breaker;
pub mod http;
pub mod mock;
pub mod price;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use http::{FacilitatorConfig, HttpPaymentClient};
pub use mock::MockPaymentClient;
pub use price::{parse_price, usd_to_lamports, PriceError, LAMPORTS_PER_SOL};

/// Request to pay a vendor for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    /// Price string, e.g. `"5000 lamports"` or `"$0.01"`
    pub price: String,
    /// Vendor address receiving the payment
    pub vendor: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl PaymentRequest {
    pub fn new(
        price: impl Into<String>,
        vendor: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            price: price.into(),
            vendor: vendor.into(),
            endpoint: endpoint.into(),
            description: None,
            correlation_id: None,
            idempotency_key: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The caller's idempotency key, or one derived from the request fields
    pub fn effective_idempotency_key(&self) -> String {
        self.idempotency_key.clone().unwrap_or_else(|| {
            idempotency_key(
                self.correlation_id.as_deref().unwrap_or_default(),
                &self.vendor,
                &self.endpoint,
                &self.price,
            )
        })
    }
}

/// Proof of a settled payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentReceipt {
    /// Transaction signature
    pub signature: String,
    /// Settled amount in lamports
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
    pub vendor: String,
    pub endpoint: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub idempotency_key: String,
    /// Network the payment settled on, e.g. `devnet`
    pub network: String,
}

/// Payment client errors
#[derive(Debug, Error)]
pub enum PaymentError {
    #[error(transparent)]
    InvalidPrice(#[from] PriceError),

    #[error("Payment to {vendor} rejected: {reason}")]
    Rejected { vendor: String, reason: String },

    #[error("Circuit breaker is open: {0}")]
    CircuitOpen(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Client able to settle payments and verify receipts
#[async_trait]
pub trait PaymentClient: Send + Sync {
    /// Settle a payment, returning its receipt
    async fn pay(&self, request: PaymentRequest) -> Result<PaymentReceipt, PaymentError>;

    /// Check that a receipt corresponds to a settled payment
    async fn verify(&self, receipt: &PaymentReceipt) -> Result<bool, PaymentError>;
}

/// Deterministic idempotency key for a payment attempt
pub fn idempotency_key(correlation_id: &str, vendor: &str, endpoint: &str, price: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [correlation_id, vendor, endpoint, price] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_is_stable() {
        let a = idempotency_key("c1", "V1", "https://x", "5000");
        let b = idempotency_key("c1", "V1", "https://x", "5000");
        let c = idempotency_key("c2", "V1", "https://x", "5000");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_field_boundaries_matter() {
        assert_ne!(
            idempotency_key("ab", "c", "e", "1"),
            idempotency_key("a", "bc", "e", "1")
        );
    }

    #[test]
    fn test_explicit_key_wins() {
        let mut request = PaymentRequest::new("5000", "V1", "https://x").with_correlation_id("c1");
        let derived = request.effective_idempotency_key();
        assert_eq!(derived, idempotency_key("c1", "V1", "https://x", "5000"));

        request.idempotency_key = Some("caller-key".to_string());
        assert_eq!(request.effective_idempotency_key(), "caller-key");
    }

    #[test]
    fn test_request_serializes_camel_case() {
        let request = PaymentRequest::new("$0.01", "V1", "https://x").with_correlation_id("c1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["correlationId"], "c1");
        assert!(json.get("description").is_none());
    }
}
