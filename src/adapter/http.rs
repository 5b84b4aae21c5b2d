//! Adapter for a fixed-price paid HTTP endpoint

use super::{settle_payment, AdapterContext, AdapterError, AdapterResult, ServiceAdapter};
use crate::payment::{parse_price, PaymentClient, PaymentRequest};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const SIGNATURE_HEADER: &str = "x-payment-signature";
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Pays a fixed price, then POSTs the action input as JSON to the endpoint
/// with the payment signature attached.
pub struct PaidHttpAdapter {
    name: String,
    vendor: String,
    endpoint: String,
    price: String,
    price_lamports: u64,
    description: Option<String>,
    client: Arc<dyn PaymentClient>,
    http: Client,
}

impl PaidHttpAdapter {
    /// `sol_price_usd` converts a USD `price` into the lamport estimate
    pub fn new(
        name: impl Into<String>,
        vendor: impl Into<String>,
        endpoint: impl Into<String>,
        price: impl Into<String>,
        sol_price_usd: f64,
        client: Arc<dyn PaymentClient>,
    ) -> Result<Self, AdapterError> {
        let price = price.into();
        let price_lamports = parse_price(&price, sol_price_usd)
            .map_err(|e| AdapterError::Invalid(e.to_string()))?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AdapterError::Upstream(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            vendor: vendor.into(),
            endpoint: endpoint.into(),
            price,
            price_lamports,
            description: None,
            client,
            http,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ServiceAdapter for PaidHttpAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn vendor(&self) -> Option<&str> {
        Some(&self.vendor)
    }

    fn estimate_cost(&self, _input: &Value) -> u64 {
        self.price_lamports
    }

    async fn execute(&self, input: Value, ctx: &AdapterContext) -> Result<AdapterResult, AdapterError> {
        let start = Instant::now();

        let mut request = PaymentRequest::new(&self.price, &self.vendor, &self.endpoint);
        request.description = self.description.clone();
        let receipt = settle_payment(ctx, self.client.as_ref(), request).await?;

        debug!(adapter = %self.name, endpoint = %self.endpoint, "Calling paid endpoint");

        let response = self
            .http
            .post(&self.endpoint)
            .header(SIGNATURE_HEADER, &receipt.signature)
            .header(CORRELATION_HEADER, &ctx.correlation_id)
            .json(&input)
            .send()
            .await
            .map_err(|e| AdapterError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            warn!(
                signature = %receipt.signature,
                "Paid call failed after settlement: {}",
                status
            );
            return Err(AdapterError::Upstream(format!(
                "Status {}: {}",
                status, error_text
            )));
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| AdapterError::Upstream(format!("invalid response body: {}", e)))?;

        Ok(AdapterResult {
            data,
            cost: receipt.amount,
            vendor: Some(receipt.vendor.clone()),
            receipt: Some(receipt),
            duration: start.elapsed(),
        })
    }
}
