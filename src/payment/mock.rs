//! In-process payment client for tests and local simulations

use super::price::parse_price;
use super::{PaymentClient, PaymentError, PaymentReceipt, PaymentRequest};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Payment client that settles instantly in memory.
///
/// Receipts are deterministic: the signature is derived from the request's
/// idempotency key, and a repeated key returns the original receipt.
#[derive(Debug)]
pub struct MockPaymentClient {
    sol_price_usd: f64,
    network: String,
    latency: Duration,
    jitter: Duration,
    failure: Option<String>,
    fail_next: AtomicUsize,
    requests: Mutex<Vec<PaymentRequest>>,
    settled: DashMap<String, PaymentReceipt>,
}

impl MockPaymentClient {
    pub fn new(sol_price_usd: f64) -> Self {
        Self {
            sol_price_usd,
            network: "devnet".to_string(),
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            failure: None,
            fail_next: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            settled: DashMap::new(),
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    /// Delay every payment by `latency` plus up to `jitter`
    pub fn with_latency(mut self, latency: Duration, jitter: Duration) -> Self {
        self.latency = latency;
        self.jitter = jitter;
        self
    }

    /// Reject every payment with `reason`
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Reject the next `count` payments
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Requests seen so far, including rejected ones
    pub fn requests(&self) -> Vec<PaymentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn settled_count(&self) -> usize {
        self.settled.len()
    }

    fn delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        self.latency + Duration::from_millis(extra)
    }

    fn take_injected_failure(&self) -> Option<String> {
        if let Some(reason) = &self.failure {
            return Some(reason.clone());
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| "injected failure".to_string())
    }
}

#[async_trait]
impl PaymentClient for MockPaymentClient {
    async fn pay(&self, request: PaymentRequest) -> Result<PaymentReceipt, PaymentError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let delay = self.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(reason) = self.take_injected_failure() {
            return Err(PaymentError::Rejected {
                vendor: request.vendor,
                reason,
            });
        }

        let amount = parse_price(&request.price, self.sol_price_usd)?;
        let idempotency_key = request.effective_idempotency_key();
        let signature = hex::encode(Sha256::digest(idempotency_key.as_bytes()));

        if let Some(existing) = self.settled.get(&signature) {
            debug!(signature = %signature, "Replayed idempotent payment");
            return Ok(existing.clone());
        }

        let receipt = PaymentReceipt {
            signature: signature.clone(),
            amount,
            timestamp: Utc::now(),
            vendor: request.vendor,
            endpoint: request.endpoint,
            correlation_id: request.correlation_id.unwrap_or_default(),
            idempotency_key,
            network: self.network.clone(),
        };
        self.settled.insert(signature, receipt.clone());

        debug!(
            vendor = %receipt.vendor,
            amount = receipt.amount,
            "Mock payment settled"
        );
        Ok(receipt)
    }

    async fn verify(&self, receipt: &PaymentReceipt) -> Result<bool, PaymentError> {
        Ok(self
            .settled
            .get(&receipt.signature)
            .map(|settled| settled.amount == receipt.amount && settled.vendor == receipt.vendor)
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pay_and_verify() {
        let client = MockPaymentClient::new(100.0);
        let request = PaymentRequest::new("5000 lamports", "V1", "https://api.example.com")
            .with_correlation_id("c1");

        let receipt = client.pay(request).await.unwrap();
        assert_eq!(receipt.amount, 5_000);
        assert_eq!(receipt.vendor, "V1");
        assert_eq!(receipt.correlation_id, "c1");
        assert_eq!(receipt.network, "devnet");
        assert!(client.verify(&receipt).await.unwrap());

        let mut forged = receipt.clone();
        forged.amount = 1;
        assert!(!client.verify(&forged).await.unwrap());
    }

    #[tokio::test]
    async fn test_usd_price_uses_rate() {
        let client = MockPaymentClient::new(100.0);
        let receipt = client
            .pay(PaymentRequest::new("$0.01", "V1", "https://x"))
            .await
            .unwrap();
        assert_eq!(receipt.amount, 100_000);
    }

    #[tokio::test]
    async fn test_repeated_key_replays_receipt() {
        let client = MockPaymentClient::new(100.0);
        let request = PaymentRequest::new("10", "V1", "https://x").with_correlation_id("c1");

        let first = client.pay(request.clone()).await.unwrap();
        let second = client.pay(request).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(client.settled_count(), 1);
        assert_eq!(client.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_fail_next_then_recover() {
        let client = MockPaymentClient::new(100.0);
        client.fail_next(1);

        let err = client
            .pay(PaymentRequest::new("10", "V1", "https://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Rejected { .. }));

        assert!(client
            .pay(PaymentRequest::new("10", "V1", "https://x"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_invalid_price_is_rejected() {
        let client = MockPaymentClient::new(100.0);
        let err = client
            .pay(PaymentRequest::new("free", "V1", "https://x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidPrice(_)));
        assert_eq!(client.settled_count(), 0);
    }
}
