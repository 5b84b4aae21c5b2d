//! Payment policy and spend-history models

use crate::error::{Result, SpendError};
use crate::payment::PaymentReceipt;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;

/// Who is spending, attached to every telemetry event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Extra caller-defined attribution fields, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Provenance {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task_id: None,
            extra: Map::new(),
        }
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// Conditions under which an agent should stop spending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HaltConditions {
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Deadline for a paid call in milliseconds; 0 disables the deadline
    #[serde(default = "default_settlement_timeout_ms")]
    pub settlement_timeout_ms: u64,
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_settlement_timeout_ms() -> u64 {
    30_000
}

impl Default for HaltConditions {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            settlement_timeout_ms: default_settlement_timeout_ms(),
        }
    }
}

impl HaltConditions {
    pub fn settlement_timeout(&self) -> Option<Duration> {
        if self.settlement_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.settlement_timeout_ms))
        }
    }
}

/// Spending policy for one agent, in the camelCase JSON shape it is
/// distributed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentPolicy {
    #[serde(default)]
    pub allowed_vendors: BTreeSet<String>,
    /// Spend cap per window, in lamports
    pub budget_cap: u64,
    /// Window length in seconds
    #[serde(default = "default_budget_window")]
    pub budget_window: u64,
    /// Max requests per window keyed by lowercased vendor address
    #[serde(default)]
    pub rate_limits: HashMap<String, u32>,
    #[serde(default)]
    pub halt_conditions: HaltConditions,
    pub provenance: Provenance,
}

fn default_budget_window() -> u64 {
    86_400
}

impl PaymentPolicy {
    pub fn new(agent_id: impl Into<String>, budget_cap: u64, budget_window: u64) -> Self {
        Self {
            allowed_vendors: BTreeSet::new(),
            budget_cap,
            budget_window,
            rate_limits: HashMap::new(),
            halt_conditions: HaltConditions::default(),
            provenance: Provenance::new(agent_id),
        }
    }

    pub fn allow_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.allowed_vendors.insert(vendor.into());
        self
    }

    pub fn rate_limit(mut self, vendor: &str, max_requests: u32) -> Self {
        self.rate_limits.insert(vendor.to_lowercase(), max_requests);
        self
    }

    pub fn halt_conditions(mut self, conditions: HaltConditions) -> Self {
        self.halt_conditions = conditions;
        self
    }

    /// Parse a policy document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let policy: Self = serde_json::from_str(json)
            .map_err(|e| SpendError::Config(format!("invalid payment policy: {}", e)))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn is_vendor_allowed(&self, vendor: &str) -> bool {
        self.allowed_vendors.contains(vendor)
    }

    /// Rate limit for a vendor; `None` means unlimited
    pub fn rate_limit_for(&self, vendor: &str) -> Option<u32> {
        self.rate_limits
            .get(&vendor.to_lowercase())
            .or_else(|| self.rate_limits.get(vendor))
            .copied()
    }

    pub fn agent_id(&self) -> &str {
        &self.provenance.agent_id
    }

    /// Validate that the policy is usable
    pub fn validate(&self) -> Result<()> {
        if self.provenance.agent_id.trim().is_empty() {
            return Err(SpendError::Config(
                "policy provenance.agentId must not be empty".to_string(),
            ));
        }
        if self.budget_window == 0 {
            return Err(SpendError::Config(
                "policy budgetWindow must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Reason a spend was refused by policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("Vendor not allowed: {vendor}")]
    VendorNotAllowed { vendor: String },

    #[error("Rate limit exceeded for {vendor}: {count} of {limit} requests used this window")]
    RateLimitExceeded {
        vendor: String,
        count: u32,
        limit: u32,
    },

    #[error("Policy budget cap exceeded: {spent} spent + {requested} requested > {cap} lamports")]
    BudgetCapExceeded { spent: u64, requested: u64, cap: u64 },
}

impl PolicyViolation {
    /// Short label for metrics and logs
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::VendorNotAllowed { .. } => "vendor_not_allowed",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::BudgetCapExceeded { .. } => "budget_cap_exceeded",
        }
    }
}

/// A settled payment counted against the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendRecord {
    pub correlation_id: String,
    pub vendor: String,
    pub amount: u64,
    pub signature: String,
    pub settled_at: DateTime<Utc>,
}

impl From<&PaymentReceipt> for SpendRecord {
    fn from(receipt: &PaymentReceipt) -> Self {
        Self {
            correlation_id: receipt.correlation_id.clone(),
            vendor: receipt.vendor.clone(),
            amount: receipt.amount,
            signature: receipt.signature.clone(),
            settled_at: receipt.timestamp,
        }
    }
}

/// Aggregate spend in the current window as seen by the policy engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetStatus {
    pub total_spent: u64,
    pub remaining: u64,
    pub cap: u64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Settled lamports per vendor, in first-payment order
    pub vendor_spending: IndexMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY_JSON: &str = r#"{
        "allowedVendors": ["VendorA", "VendorB"],
        "budgetCap": 5000000,
        "budgetWindow": 3600,
        "rateLimits": {"vendora": 10},
        "provenance": {"agentId": "agent-7", "taskId": "task-1", "team": "research"},
        "haltConditions": {"maxConsecutiveFailures": 5, "settlementTimeoutMs": 15000}
    }"#;

    #[test]
    fn test_policy_parses_verbatim_document() {
        let policy = PaymentPolicy::from_json_str(POLICY_JSON).unwrap();

        assert_eq!(policy.budget_cap, 5_000_000);
        assert_eq!(policy.budget_window, 3600);
        assert!(policy.is_vendor_allowed("VendorA"));
        assert!(!policy.is_vendor_allowed("VendorC"));
        assert_eq!(policy.rate_limit_for("VendorA"), Some(10));
        assert_eq!(policy.rate_limit_for("VendorB"), None);
        assert_eq!(policy.provenance.task_id.as_deref(), Some("task-1"));
        assert_eq!(policy.provenance.extra["team"], "research");
        assert_eq!(policy.halt_conditions.max_consecutive_failures, 5);
        assert_eq!(
            policy.halt_conditions.settlement_timeout(),
            Some(Duration::from_millis(15_000))
        );
    }

    #[test]
    fn test_policy_defaults() {
        let policy = PaymentPolicy::from_json_str(
            r#"{"budgetCap": 10, "provenance": {"agentId": "a"}}"#,
        )
        .unwrap();

        assert!(policy.allowed_vendors.is_empty());
        assert_eq!(policy.budget_window, 86_400);
        assert_eq!(policy.halt_conditions, HaltConditions::default());
    }

    #[test]
    fn test_policy_rejects_missing_agent() {
        let result = PaymentPolicy::from_json_str(
            r#"{"budgetCap": 10, "provenance": {"agentId": "  "}}"#,
        );
        assert!(matches!(result, Err(SpendError::Config(_))));
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let conditions = HaltConditions {
            max_consecutive_failures: 1,
            settlement_timeout_ms: 0,
        };
        assert!(conditions.settlement_timeout().is_none());
    }

    #[test]
    fn test_violation_reasons() {
        let violation = PolicyViolation::VendorNotAllowed {
            vendor: "x".to_string(),
        };
        assert_eq!(violation.reason(), "vendor_not_allowed");
        assert!(violation.to_string().contains("x"));
    }
}
