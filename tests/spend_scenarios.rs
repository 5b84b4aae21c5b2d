//! End-to-end spending scenarios through the public API

use async_trait::async_trait;
use serde_json::{json, Value};
use spend_control::budget::{BudgetWindow, ManualClock};
use spend_control::policy::Provenance;
use spend_control::telemetry::MemoryEmitter;
use spend_control::{
    AdapterContext, AdapterError, AdapterResult, AgentAction, AgentExecutor, BudgetError,
    BudgetManager, PaymentPolicy, PolicyEngine, ServiceAdapter, SpendError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct FixedAdapter {
    estimate: u64,
    delay: Duration,
    fail: Option<&'static str>,
    calls: AtomicUsize,
}

impl FixedAdapter {
    fn new(estimate: u64) -> Self {
        Self {
            estimate,
            delay: Duration::ZERO,
            fail: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ServiceAdapter for FixedAdapter {
    fn name(&self) -> &str {
        "fixed"
    }

    fn estimate_cost(&self, _input: &Value) -> u64 {
        self.estimate
    }

    async fn execute(&self, _input: Value, _ctx: &AdapterContext) -> Result<AdapterResult, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if let Some(message) = self.fail {
            return Err(anyhow::anyhow!(message).into());
        }
        Ok(AdapterResult {
            data: json!({"done": true}),
            receipt: None,
            cost: self.estimate,
            duration: self.delay,
            vendor: None,
        })
    }
}

fn ledger(cap: u64) -> Arc<BudgetManager> {
    let window = Arc::new(BudgetWindow::new(Arc::new(ManualClock::new(0)), 3600));
    Arc::new(BudgetManager::new(cap, window))
}

#[test]
fn test_reservations_exhaust_budget() {
    let budget = ledger(1_000_000);

    budget.reserve("a", 600_000).unwrap();
    assert!(!budget.can_afford(500_000));
    assert_eq!(budget.available(), 400_000);

    budget.reserve("b", 400_000).unwrap();
    assert!(!budget.can_afford(1));

    let state = budget.get_state();
    assert_eq!(state.reserved, 1_000_000);
    assert!(state.is_within_cap());
}

#[test]
fn test_reserve_then_commit_less() {
    let budget = ledger(1_000);
    budget.reserve("x", 100).unwrap();
    budget.commit("x", 80).unwrap();

    let state = budget.get_state();
    assert_eq!(state.spent, 80);
    assert_eq!(state.reserved, 0);
    assert_eq!(state.available, 920);
}

#[test]
fn test_rate_limit_counts_admitted_checks() {
    let policy = PaymentPolicy::new("agent-1", 1_000_000, 3600)
        .allow_vendor("V1")
        .rate_limit("v1", 2);
    let engine = PolicyEngine::standalone(policy);

    let results: Vec<bool> = (0..3).map(|_| engine.can_spend(10, "V1")).collect();
    assert_eq!(results, vec![true, true, false]);
}

#[tokio::test]
async fn test_adapter_failure_releases_before_propagating() {
    let budget = ledger(1_000_000);
    let sink = Arc::new(MemoryEmitter::new());
    let executor = AgentExecutor::new(budget.clone(), sink.clone(), Provenance::new("agent-1"));
    let mut adapter = FixedAdapter::new(100_000);
    adapter.fail = Some("boom");

    let err = executor
        .execute_with_id("corr-boom", AgentAction::new("call", json!({})), &adapter)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "boom");
    assert_eq!(budget.reservation("corr-boom"), None);
    assert_eq!(budget.available(), 1_000_000);

    let completed = sink.of_type("action.completed");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].correlation_id, "corr-boom");
    let payload = serde_json::to_value(&completed[0]).unwrap();
    assert_eq!(payload["payload"]["success"], false);
    assert_eq!(payload["payload"]["actualCost"], 0);
}

#[tokio::test]
async fn test_unaffordable_action_never_runs() {
    let budget = ledger(1_000_000);
    let sink = Arc::new(MemoryEmitter::new());
    let executor = AgentExecutor::new(budget.clone(), sink.clone(), Provenance::new("agent-1"));
    let adapter = FixedAdapter::new(2_000_000);

    let err = executor
        .execute(AgentAction::new("call", json!({})), &adapter)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SpendError::Budget(BudgetError::InsufficientBudget {
            requested: 2_000_000,
            available: 1_000_000
        })
    ));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    assert!(sink.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_executions_fail_exactly_one() {
    let budget = ledger(1_000_000);
    let executor = Arc::new(AgentExecutor::new(
        budget.clone(),
        Arc::new(MemoryEmitter::new()),
        Provenance::new("agent-1"),
    ));
    let mut adapter = FixedAdapter::new(600_000);
    adapter.delay = Duration::from_millis(100);
    let adapter = Arc::new(adapter);

    let handles: Vec<_> = (0..2)
        .map(|i| {
            let executor = executor.clone();
            let adapter = adapter.clone();
            tokio::spawn(async move {
                executor
                    .execute(AgentAction::new(format!("call-{}", i), json!({})), adapter.as_ref())
                    .await
            })
        })
        .collect();

    let mut successes = 0;
    let mut refusals = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) if e.is_insufficient_budget() => refusals += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(refusals, 1);
    assert_eq!(budget.get_state().spent, 600_000);
    assert!(budget.get_state().is_within_cap());
}

#[tokio::test]
async fn test_settlement_timeout_from_policy() {
    let policy = PaymentPolicy::from_json_str(
        r#"{
            "allowedVendors": [],
            "budgetCap": 1000000,
            "budgetWindow": 3600,
            "provenance": {"agentId": "agent-1"},
            "haltConditions": {"maxConsecutiveFailures": 3, "settlementTimeoutMs": 25}
        }"#,
    )
    .unwrap();
    let budget = ledger(policy.budget_cap);
    let engine = Arc::new(PolicyEngine::new(policy, budget.window().clone()));
    let executor = AgentExecutor::new(budget.clone(), Arc::new(MemoryEmitter::new()), Provenance::new("agent-1"))
        .with_policy(engine);

    let mut adapter = FixedAdapter::new(1_000);
    adapter.delay = Duration::from_secs(5);

    let err = executor
        .execute(AgentAction::new("slow", json!({})), &adapter)
        .await
        .unwrap_err();

    assert!(matches!(err, SpendError::SettlementTimeout { timeout_ms: 25, .. }));
    assert!(budget.outstanding().is_empty());
}
