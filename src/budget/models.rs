//! Data models for the reservation ledger

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable snapshot of an agent's budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetState {
    pub total: u64,
    pub spent: u64,
    pub reserved: u64,
    pub available: u64,
    pub cap: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

impl BudgetState {
    /// Check the ledger invariant `spent + reserved <= cap`
    pub fn is_within_cap(&self) -> bool {
        self.spent.saturating_add(self.reserved) <= self.cap
    }
}

/// An outstanding hold on budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub correlation_id: String,
    pub amount: u64,
}
