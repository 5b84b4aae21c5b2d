//! Vendor, rate-limit and cap enforcement for agent payments

use super::models::{BudgetStatus, PaymentPolicy, PolicyViolation, SpendRecord};
use crate::budget::{BudgetWindow, WindowSnapshot};
use crate::metrics::METRICS;
use crate::payment::PaymentReceipt;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct SpendHistory {
    epoch: u64,
    records: Vec<SpendRecord>,
    /// Requests admitted by `check_spend`, keyed by lowercased vendor
    admitted: HashMap<String, u32>,
    /// Settled payments, keyed by lowercased vendor
    settled: HashMap<String, u32>,
}

impl SpendHistory {
    fn total_spent(&self) -> u64 {
        self.records
            .iter()
            .fold(0u64, |acc, r| acc.saturating_add(r.amount))
    }
}

/// Policy engine keeping its own spend history for one agent
pub struct PolicyEngine {
    policy: PaymentPolicy,
    window: Arc<BudgetWindow>,
    history: Mutex<SpendHistory>,
}

impl PolicyEngine {
    /// Create an engine over a window, usually the one its budget manager uses
    pub fn new(policy: PaymentPolicy, window: Arc<BudgetWindow>) -> Self {
        let epoch = window.current().epoch;
        Self {
            policy,
            window,
            history: Mutex::new(SpendHistory {
                epoch,
                ..SpendHistory::default()
            }),
        }
    }

    /// Create an engine with its own system-clock window
    pub fn standalone(policy: PaymentPolicy) -> Self {
        let window = Arc::new(BudgetWindow::system(policy.budget_window));
        Self::new(policy, window)
    }

    fn lock_current(&self) -> (MutexGuard<'_, SpendHistory>, WindowSnapshot) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.window.current();

        if window.epoch != history.epoch {
            info!(
                records = history.records.len(),
                "Policy window reset, pruning spend history"
            );
            history.records.clear();
            history.admitted.clear();
            history.settled.clear();
            history.epoch = window.epoch;
        }

        (history, window)
    }

    /// Check a prospective spend, returning the reason when it is refused.
    ///
    /// Checks run in order: vendor allow-list, policy cap, vendor rate limit.
    /// An admitted check counts as one request against the vendor's limit.
    pub fn check_spend(&self, amount: u64, vendor: &str) -> Result<(), PolicyViolation> {
        let (mut history, _) = self.lock_current();

        let verdict = self.evaluate(&history, amount, vendor);
        match &verdict {
            Ok(()) => {
                *history.admitted.entry(vendor.to_lowercase()).or_insert(0) += 1;
                debug!(vendor, amount, "Policy admitted spend");
            }
            Err(violation) => {
                METRICS.record_policy_denial(violation.reason());
                info!(vendor, amount, reason = violation.reason(), "Policy denied spend");
            }
        }

        verdict
    }

    fn evaluate(
        &self,
        history: &SpendHistory,
        amount: u64,
        vendor: &str,
    ) -> Result<(), PolicyViolation> {
        if !self.policy.is_vendor_allowed(vendor) {
            return Err(PolicyViolation::VendorNotAllowed {
                vendor: vendor.to_string(),
            });
        }

        let spent = history.total_spent();
        if spent.saturating_add(amount) > self.policy.budget_cap {
            return Err(PolicyViolation::BudgetCapExceeded {
                spent,
                requested: amount,
                cap: self.policy.budget_cap,
            });
        }

        if let Some(limit) = self.policy.rate_limit_for(vendor) {
            let count = history
                .admitted
                .get(&vendor.to_lowercase())
                .copied()
                .unwrap_or(0);
            if count >= limit {
                return Err(PolicyViolation::RateLimitExceeded {
                    vendor: vendor.to_string(),
                    count,
                    limit,
                });
            }
        }

        Ok(())
    }

    /// Boolean form of [`check_spend`](Self::check_spend)
    pub fn can_spend(&self, amount: u64, vendor: &str) -> bool {
        self.check_spend(amount, vendor).is_ok()
    }

    /// Give back a request admitted by `check_spend` that never went ahead,
    /// e.g. because the budget reservation behind it was refused
    pub fn refund_request(&self, vendor: &str) {
        let (mut history, _) = self.lock_current();
        if let Some(count) = history.admitted.get_mut(&vendor.to_lowercase()) {
            *count = count.saturating_sub(1);
            debug!(vendor, remaining = *count, "Refunded admitted request");
        }
    }

    /// Add a settled receipt to the current window's history
    pub fn record_spend(&self, receipt: &PaymentReceipt) {
        let (mut history, _) = self.lock_current();

        history.records.push(SpendRecord::from(receipt));
        *history
            .settled
            .entry(receipt.vendor.to_lowercase())
            .or_insert(0) += 1;

        debug!(
            vendor = %receipt.vendor,
            amount = receipt.amount,
            signature = %receipt.signature,
            "Recorded settled spend"
        );
    }

    pub fn get_budget_status(&self) -> BudgetStatus {
        let (history, window) = self.lock_current();

        let mut vendor_spending: IndexMap<String, u64> = IndexMap::new();
        for record in &history.records {
            let entry = vendor_spending.entry(record.vendor.clone()).or_insert(0);
            *entry = entry.saturating_add(record.amount);
        }

        let total_spent = history.total_spent();
        BudgetStatus {
            total_spent,
            remaining: self.policy.budget_cap.saturating_sub(total_spent),
            cap: self.policy.budget_cap,
            window_start: window.start(),
            window_end: window.end(),
            vendor_spending,
        }
    }

    pub fn get_policy(&self) -> &PaymentPolicy {
        &self.policy
    }

    /// Requests admitted for a vendor in the current window
    pub fn request_count(&self, vendor: &str) -> u32 {
        let (history, _) = self.lock_current();
        history
            .admitted
            .get(&vendor.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Settled payments to a vendor in the current window
    pub fn settled_count(&self, vendor: &str) -> u32 {
        let (history, _) = self.lock_current();
        history
            .settled
            .get(&vendor.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Spend records in the current window
    pub fn history(&self) -> Vec<SpendRecord> {
        let (history, _) = self.lock_current();
        history.records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ManualClock;
    use chrono::Utc;
    use std::time::Duration;

    fn receipt(vendor: &str, amount: u64, correlation_id: &str) -> PaymentReceipt {
        PaymentReceipt {
            signature: format!("sig-{}", correlation_id),
            amount,
            timestamp: Utc::now(),
            vendor: vendor.to_string(),
            endpoint: "https://api.example.com/search".to_string(),
            correlation_id: correlation_id.to_string(),
            idempotency_key: format!("idem-{}", correlation_id),
            network: "devnet".to_string(),
        }
    }

    fn engine(policy: PaymentPolicy) -> (PolicyEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let window = Arc::new(BudgetWindow::new(clock.clone(), policy.budget_window));
        (PolicyEngine::new(policy, window), clock)
    }

    #[test]
    fn test_rate_limit_admits_up_to_limit() {
        let policy = PaymentPolicy::new("agent", 1_000_000, 3600)
            .allow_vendor("V1")
            .rate_limit("v1", 2);
        let (engine, _) = engine(policy);

        assert!(engine.can_spend(10, "V1"));
        assert!(engine.can_spend(10, "V1"));
        assert!(!engine.can_spend(10, "V1"));
        assert_eq!(
            engine.check_spend(10, "V1"),
            Err(PolicyViolation::RateLimitExceeded {
                vendor: "V1".to_string(),
                count: 2,
                limit: 2
            })
        );
    }

    #[test]
    fn test_refund_returns_admitted_slot() {
        let policy = PaymentPolicy::new("agent", 1_000_000, 3600)
            .allow_vendor("V1")
            .rate_limit("v1", 1);
        let (engine, _) = engine(policy);

        assert!(engine.can_spend(10, "V1"));
        assert!(!engine.can_spend(10, "V1"));

        engine.refund_request("V1");
        assert_eq!(engine.request_count("v1"), 0);
        assert!(engine.can_spend(10, "V1"));

        // Nothing to refund for a vendor never admitted
        engine.refund_request("V2");
        assert_eq!(engine.request_count("V2"), 0);
    }

    #[test]
    fn test_unlisted_vendor_denied() {
        let policy = PaymentPolicy::new("agent", 1_000, 3600).allow_vendor("V1");
        let (engine, _) = engine(policy);

        assert_eq!(
            engine.check_spend(1, "V2"),
            Err(PolicyViolation::VendorNotAllowed {
                vendor: "V2".to_string()
            })
        );
        assert_eq!(engine.request_count("V2"), 0);
    }

    #[test]
    fn test_cap_uses_recorded_history() {
        let policy = PaymentPolicy::new("agent", 1_000, 3600).allow_vendor("V1");
        let (engine, _) = engine(policy);

        engine.record_spend(&receipt("V1", 700, "a"));
        assert!(engine.can_spend(300, "V1"));
        assert_eq!(
            engine.check_spend(301, "V1"),
            Err(PolicyViolation::BudgetCapExceeded {
                spent: 700,
                requested: 301,
                cap: 1_000
            })
        );
    }

    #[test]
    fn test_missing_rate_limit_is_unlimited() {
        let policy = PaymentPolicy::new("agent", u64::MAX, 3600).allow_vendor("V1");
        let (engine, _) = engine(policy);

        for _ in 0..100 {
            assert!(engine.can_spend(1, "V1"));
        }
        assert_eq!(engine.request_count("V1"), 100);
    }

    #[test]
    fn test_budget_status_groups_by_vendor() {
        let policy = PaymentPolicy::new("agent", 10_000, 3600)
            .allow_vendor("V1")
            .allow_vendor("V2");
        let (engine, _) = engine(policy);

        engine.record_spend(&receipt("V2", 100, "a"));
        engine.record_spend(&receipt("V1", 250, "b"));
        engine.record_spend(&receipt("V2", 50, "c"));

        let status = engine.get_budget_status();
        assert_eq!(status.total_spent, 400);
        assert_eq!(status.remaining, 9_600);
        assert_eq!(status.cap, 10_000);
        let vendors: Vec<_> = status.vendor_spending.iter().collect();
        assert_eq!(
            vendors,
            vec![(&"V2".to_string(), &150), (&"V1".to_string(), &250)]
        );
        assert_eq!(engine.settled_count("v2"), 2);
    }

    #[test]
    fn test_window_reset_prunes_history_and_counters() {
        let policy = PaymentPolicy::new("agent", 1_000, 60)
            .allow_vendor("V1")
            .rate_limit("V1", 1);
        let (engine, clock) = engine(policy);

        assert!(engine.can_spend(100, "V1"));
        engine.record_spend(&receipt("V1", 900, "a"));
        assert!(!engine.can_spend(50, "V1"));

        clock.advance(Duration::from_secs(61));

        let status = engine.get_budget_status();
        assert_eq!(status.total_spent, 0);
        assert!(status.vendor_spending.is_empty());
        assert!(engine.can_spend(1_000, "V1"));
        assert!(engine.history().is_empty());
    }

    #[test]
    fn test_get_policy_returns_configuration() {
        let policy = PaymentPolicy::new("agent-9", 42, 3600);
        let (engine, _) = engine(policy.clone());
        assert_eq!(engine.get_policy(), &policy);
    }
}
