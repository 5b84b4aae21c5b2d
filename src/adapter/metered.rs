//! Adapter priced per unit of input, e.g. per token or per page

use super::{settle_payment, AdapterContext, AdapterError, AdapterResult, ServiceAdapter};
use crate::payment::{PaymentClient, PaymentReceipt, PaymentRequest};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// The work behind a metered adapter
#[async_trait]
pub trait MeteredHandler: Send + Sync {
    /// Billable units in an input. Must not have side effects.
    fn units(&self, input: &Value) -> u64;

    /// Perform the paid work once payment has settled
    async fn handle(&self, input: Value, receipt: &PaymentReceipt) -> anyhow::Result<Value>;
}

/// Charges `base_price + unit_price * units(input)` lamports per call
pub struct MeteredAdapter {
    name: String,
    vendor: String,
    endpoint: String,
    base_price: u64,
    unit_price: u64,
    max_units: Option<u64>,
    handler: Arc<dyn MeteredHandler>,
    client: Arc<dyn PaymentClient>,
}

impl MeteredAdapter {
    pub fn new(
        name: impl Into<String>,
        vendor: impl Into<String>,
        endpoint: impl Into<String>,
        handler: Arc<dyn MeteredHandler>,
        client: Arc<dyn PaymentClient>,
    ) -> Self {
        Self {
            name: name.into(),
            vendor: vendor.into(),
            endpoint: endpoint.into(),
            base_price: 0,
            unit_price: 1,
            max_units: None,
            handler,
            client,
        }
    }

    pub fn with_pricing(mut self, base_price: u64, unit_price: u64) -> Self {
        self.base_price = base_price;
        self.unit_price = unit_price;
        self
    }

    /// Refuse inputs larger than `max_units`
    pub fn with_max_units(mut self, max_units: u64) -> Self {
        self.max_units = Some(max_units);
        self
    }

    fn price_for(&self, units: u64) -> u64 {
        self.base_price
            .saturating_add(self.unit_price.saturating_mul(units))
    }
}

#[async_trait]
impl ServiceAdapter for MeteredAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn vendor(&self) -> Option<&str> {
        Some(&self.vendor)
    }

    fn estimate_cost(&self, input: &Value) -> u64 {
        self.price_for(self.handler.units(input))
    }

    async fn execute(&self, input: Value, ctx: &AdapterContext) -> Result<AdapterResult, AdapterError> {
        let start = Instant::now();

        let units = self.handler.units(&input);
        if let Some(max) = self.max_units {
            if units > max {
                return Err(AdapterError::Invalid(format!(
                    "{} units exceeds the limit of {}",
                    units, max
                )));
            }
        }

        let price = self.price_for(units);
        if price == 0 {
            // Nothing to pay for
            let data = self.handler.handle(input, &free_receipt(ctx, self)).await?;
            return Ok(AdapterResult {
                data,
                receipt: None,
                cost: 0,
                duration: start.elapsed(),
                vendor: Some(self.vendor.clone()),
            });
        }

        let request = PaymentRequest::new(format!("{} lamports", price), &self.vendor, &self.endpoint)
            .with_description(format!("{} x{}", self.name, units));
        let receipt = settle_payment(ctx, self.client.as_ref(), request).await?;

        let data = self.handler.handle(input, &receipt).await?;

        Ok(AdapterResult {
            data,
            cost: receipt.amount,
            vendor: Some(receipt.vendor.clone()),
            receipt: Some(receipt),
            duration: start.elapsed(),
        })
    }
}

fn free_receipt(ctx: &AdapterContext, adapter: &MeteredAdapter) -> PaymentReceipt {
    PaymentReceipt {
        signature: String::new(),
        amount: 0,
        timestamp: chrono::Utc::now(),
        vendor: adapter.vendor.clone(),
        endpoint: adapter.endpoint.clone(),
        correlation_id: ctx.correlation_id.clone(),
        idempotency_key: String::new(),
        network: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::MockPaymentClient;
    use crate::policy::Provenance;
    use crate::telemetry::{EventScope, MemoryEmitter};
    use serde_json::json;

    /// Bills one unit per whitespace-separated word of `text`
    struct WordCounter;

    #[async_trait]
    impl MeteredHandler for WordCounter {
        fn units(&self, input: &Value) -> u64 {
            input["text"]
                .as_str()
                .map(|t| t.split_whitespace().count() as u64)
                .unwrap_or(0)
        }

        async fn handle(&self, input: Value, receipt: &PaymentReceipt) -> anyhow::Result<Value> {
            Ok(json!({
                "words": self.units(&input),
                "paid": receipt.amount,
            }))
        }
    }

    fn adapter(client: Arc<MockPaymentClient>) -> MeteredAdapter {
        MeteredAdapter::new("wordcount", "V2", "local://wordcount", Arc::new(WordCounter), client)
            .with_pricing(1_000, 250)
    }

    fn context(sink: Arc<MemoryEmitter>) -> AdapterContext {
        AdapterContext::new(
            EventScope::new("corr-2", Provenance::new("agent-1")),
            1_000_000,
            sink,
        )
    }

    #[test]
    fn test_estimate_scales_with_units() {
        let adapter = adapter(Arc::new(MockPaymentClient::new(100.0)));
        assert_eq!(adapter.estimate_cost(&json!({"text": "one two three"})), 1_750);
        assert_eq!(adapter.estimate_cost(&json!({})), 1_000);
    }

    #[tokio::test]
    async fn test_execute_charges_metered_price() {
        let client = Arc::new(MockPaymentClient::new(100.0));
        let sink = Arc::new(MemoryEmitter::new());

        let result = adapter(client.clone())
            .execute(json!({"text": "a b"}), &context(sink.clone()))
            .await
            .unwrap();

        assert_eq!(result.cost, 1_500);
        assert_eq!(result.data["words"], 2);
        assert_eq!(result.data["paid"], 1_500);
        assert_eq!(client.requests()[0].price, "1500 lamports");
        assert_eq!(sink.types(), vec!["payment.initiated", "payment.settled"]);
    }

    #[tokio::test]
    async fn test_oversized_input_rejected_before_payment() {
        let client = Arc::new(MockPaymentClient::new(100.0));
        let sink = Arc::new(MemoryEmitter::new());

        let err = adapter(client.clone())
            .with_max_units(1)
            .execute(json!({"text": "a b c"}), &context(sink.clone()))
            .await
            .unwrap_err();

        assert!(matches!(err, AdapterError::Invalid(_)));
        assert!(client.requests().is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_free_call_skips_payment() {
        let client = Arc::new(MockPaymentClient::new(100.0));
        let sink = Arc::new(MemoryEmitter::new());
        let adapter = MeteredAdapter::new(
            "wordcount",
            "V2",
            "local://wordcount",
            Arc::new(WordCounter),
            client.clone(),
        )
        .with_pricing(0, 0);

        let result = adapter
            .execute(json!({"text": "a"}), &context(sink.clone()))
            .await
            .unwrap();

        assert_eq!(result.cost, 0);
        assert!(result.receipt.is_none());
        assert!(client.requests().is_empty());
        assert!(sink.is_empty());
    }
}
