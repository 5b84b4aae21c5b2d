//! Service adapters: one per paid capability
//!
//! An adapter prices a call up front, then pays through a [`PaymentClient`]
//! and performs the call. The executor owns the budget; an adapter only sees
//! the remaining amount as advisory information.

pub mod http;
pub mod metered;

use crate::payment::{PaymentClient, PaymentError, PaymentReceipt, PaymentRequest};
use crate::telemetry::{emit_logged, EventPayload, EventScope, TelemetryEmitter};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub use http::PaidHttpAdapter;
pub use metered::{MeteredAdapter, MeteredHandler};

/// Adapter execution errors
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Everything an adapter gets to know about the action it runs
#[derive(Clone)]
pub struct AdapterContext {
    pub correlation_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    /// Budget left when the action started. Advisory only.
    pub budget_remaining: u64,
    scope: EventScope,
    emitter: Arc<dyn TelemetryEmitter>,
}

impl AdapterContext {
    pub fn new(scope: EventScope, budget_remaining: u64, emitter: Arc<dyn TelemetryEmitter>) -> Self {
        Self {
            correlation_id: scope.correlation_id.clone(),
            agent_id: scope.agent_id.clone(),
            task_id: scope.task_id.clone(),
            budget_remaining,
            scope,
            emitter,
        }
    }

    /// Emit a telemetry event attributed to this action
    pub async fn emit(&self, payload: EventPayload) {
        emit_logged(self.emitter.as_ref(), self.scope.event(payload)).await;
    }

    pub fn scope(&self) -> &EventScope {
        &self.scope
    }
}

impl std::fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterContext")
            .field("correlation_id", &self.correlation_id)
            .field("agent_id", &self.agent_id)
            .field("task_id", &self.task_id)
            .field("budget_remaining", &self.budget_remaining)
            .finish_non_exhaustive()
    }
}

/// Outcome of a successful adapter call
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResult {
    pub data: Value,
    /// Receipt of the payment made for this call, if one was made
    pub receipt: Option<PaymentReceipt>,
    /// Actual cost in lamports
    pub cost: u64,
    pub duration: Duration,
    pub vendor: Option<String>,
}

/// A paid capability the executor can run
#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Adapter name, used as a label in logs and metrics
    fn name(&self) -> &str;

    /// Vendor address this adapter pays, checked against policy when known
    fn vendor(&self) -> Option<&str> {
        None
    }

    /// Expected cost in lamports. Must not have side effects.
    fn estimate_cost(&self, input: &Value) -> u64;

    async fn execute(&self, input: Value, ctx: &AdapterContext) -> Result<AdapterResult, AdapterError>;
}

/// Pay for a call, emitting `payment.initiated` then `payment.settled` or
/// `payment.failed`.
///
/// The request is stamped with the action's correlation id if it has none.
pub async fn settle_payment(
    ctx: &AdapterContext,
    client: &dyn PaymentClient,
    mut request: PaymentRequest,
) -> Result<PaymentReceipt, PaymentError> {
    if request.correlation_id.is_none() {
        request.correlation_id = Some(ctx.correlation_id.clone());
    }

    ctx.emit(EventPayload::PaymentInitiated {
        vendor: request.vendor.clone(),
        endpoint: request.endpoint.clone(),
        price: request.price.clone(),
    })
    .await;

    let vendor = request.vendor.clone();
    let endpoint = request.endpoint.clone();

    match client.pay(request).await {
        Ok(receipt) => {
            debug!(
                correlation_id = %ctx.correlation_id,
                signature = %receipt.signature,
                "Payment settled for action"
            );
            ctx.emit(EventPayload::PaymentSettled {
                vendor: receipt.vendor.clone(),
                endpoint: receipt.endpoint.clone(),
                signature: receipt.signature.clone(),
                amount: receipt.amount,
                network: receipt.network.clone(),
            })
            .await;
            Ok(receipt)
        }
        Err(e) => {
            ctx.emit(EventPayload::PaymentFailed {
                vendor,
                endpoint,
                error: e.to_string(),
            })
            .await;
            Err(e)
        }
    }
}
