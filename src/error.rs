//! Crate-wide error type

use crate::adapter::AdapterError;
use crate::budget::BudgetError;
use crate::payment::PaymentError;
use crate::policy::PolicyViolation;
use crate::telemetry::TelemetryError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpendError {
    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error("Policy violation: {0}")]
    Policy(#[from] PolicyViolation),

    /// Adapter failures pass through with their original message
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("Settlement timed out after {timeout_ms}ms (correlation id {correlation_id})")]
    SettlementTimeout {
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("Agent {agent_id} is halted after {consecutive_failures} consecutive failures")]
    AgentHalted {
        agent_id: String,
        consecutive_failures: u32,
    },

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SpendError {
    /// Whether the action was refused for lack of budget
    pub fn is_insufficient_budget(&self) -> bool {
        matches!(
            self,
            Self::Budget(BudgetError::InsufficientBudget { .. })
        )
    }

    /// Whether the action was refused before anything ran
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Budget(_) | Self::Policy(_) | Self::AgentHalted { .. })
    }
}

pub type Result<T> = std::result::Result<T, SpendError>;
