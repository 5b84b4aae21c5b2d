//! Telemetry event union

use crate::policy::Provenance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event-specific payload. Serialized as `{"type": ..., "payload": {...}}`
/// and flattened into [`TelemetryEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventPayload {
    #[serde(rename = "payment.initiated", rename_all = "camelCase")]
    PaymentInitiated {
        vendor: String,
        endpoint: String,
        price: String,
    },

    #[serde(rename = "payment.settled", rename_all = "camelCase")]
    PaymentSettled {
        vendor: String,
        endpoint: String,
        signature: String,
        amount: u64,
        network: String,
    },

    #[serde(rename = "payment.failed", rename_all = "camelCase")]
    PaymentFailed {
        vendor: String,
        endpoint: String,
        error: String,
    },

    #[serde(rename = "action.started", rename_all = "camelCase")]
    ActionStarted {
        action_type: String,
        input: Value,
        estimated_cost: u64,
    },

    #[serde(rename = "action.completed", rename_all = "camelCase")]
    ActionCompleted {
        action_type: String,
        output: Option<Value>,
        actual_cost: u64,
        duration_ms: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "budget.delta", rename_all = "camelCase")]
    BudgetDelta {
        /// `commit` or `release`
        reason: String,
        amount: u64,
        spent: u64,
        reserved: u64,
        available: u64,
        cap: u64,
    },

    #[serde(rename = "agent.halted", rename_all = "camelCase")]
    AgentHalted {
        reason: String,
        consecutive_failures: u32,
        max_consecutive_failures: u32,
    },

    #[serde(rename = "sla.outcome", rename_all = "camelCase")]
    SlaOutcome {
        action_type: String,
        target_ms: u64,
        actual_ms: u64,
        met: bool,
    },
}

impl EventPayload {
    /// Wire name of the event, e.g. `action.started`
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PaymentInitiated { .. } => "payment.initiated",
            Self::PaymentSettled { .. } => "payment.settled",
            Self::PaymentFailed { .. } => "payment.failed",
            Self::ActionStarted { .. } => "action.started",
            Self::ActionCompleted { .. } => "action.completed",
            Self::BudgetDelta { .. } => "budget.delta",
            Self::AgentHalted { .. } => "agent.halted",
            Self::SlaOutcome { .. } => "sla.outcome",
        }
    }
}

/// One auditable event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    pub timestamp: DateTime<Utc>,
    pub correlation_id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub provenance: Provenance,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl TelemetryEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Attribution shared by every event of one action
#[derive(Debug, Clone, PartialEq)]
pub struct EventScope {
    pub correlation_id: String,
    pub agent_id: String,
    pub task_id: Option<String>,
    pub provenance: Provenance,
}

impl EventScope {
    pub fn new(correlation_id: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            agent_id: provenance.agent_id.clone(),
            task_id: provenance.task_id.clone(),
            provenance,
        }
    }

    /// Attribute events to a task, overriding the provenance default
    pub fn with_task(mut self, task_id: Option<String>) -> Self {
        if task_id.is_some() {
            self.task_id = task_id;
        }
        self
    }

    /// Stamp a payload with this scope and the current time
    pub fn event(&self, payload: EventPayload) -> TelemetryEvent {
        TelemetryEvent {
            timestamp: Utc::now(),
            correlation_id: self.correlation_id.clone(),
            agent_id: self.agent_id.clone(),
            task_id: self.task_id.clone(),
            provenance: self.provenance.clone(),
            payload,
        }
    }
}
