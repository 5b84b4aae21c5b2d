//! Sessions built from configuration, driving the reference adapters

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use spend_control::adapter::{MeteredAdapter, MeteredHandler};
use spend_control::api::build_status_routes;
use spend_control::config::{read_policy, PaymentBackend, SpendConfig};
use spend_control::payment::PaymentReceipt;
use spend_control::{AgentAction, AgentSession, PolicyViolation, SpendError};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceExt;

const POLICY: &str = r#"{
    "allowedVendors": ["VendorA"],
    "budgetCap": 50000,
    "budgetWindow": 3600,
    "rateLimits": {"vendora": 5},
    "provenance": {"agentId": "research-agent", "taskId": "t-42", "team": "search"},
    "haltConditions": {"maxConsecutiveFailures": 2, "settlementTimeoutMs": 5000}
}"#;

struct WordCount;

#[async_trait]
impl MeteredHandler for WordCount {
    fn units(&self, input: &Value) -> u64 {
        input["text"]
            .as_str()
            .map(|t| t.split_whitespace().count() as u64)
            .unwrap_or(0)
    }

    async fn handle(&self, input: Value, receipt: &PaymentReceipt) -> anyhow::Result<Value> {
        Ok(json!({"words": self.units(&input), "paid": receipt.amount}))
    }
}

fn write_policy(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{}-{}.json", name, uuid::Uuid::new_v4()));
    std::fs::write(&path, POLICY).unwrap();
    path
}

fn session() -> Arc<AgentSession> {
    let path = write_policy("session");
    let config = SpendConfig::from_toml_str(&format!(
        r#"
        payment_backend = "mock"
        policy_path = "{}"

        [telemetry]
        log_events = false
        "#,
        path.display()
    ))
    .unwrap();
    assert_eq!(config.payment_backend, PaymentBackend::Mock);

    let session = AgentSession::from_config(&config).unwrap();
    std::fs::remove_file(path).ok();
    Arc::new(session)
}

fn metered(session: &AgentSession, vendor: &str) -> MeteredAdapter {
    MeteredAdapter::new(
        "word-count",
        vendor,
        "https://words.example.com/count",
        Arc::new(WordCount),
        session.payment_client().unwrap(),
    )
    .with_pricing(1_000, 500)
}

#[test]
fn test_policy_file_round_trip() {
    let path = write_policy("policy");
    let policy = read_policy(&path).unwrap();
    std::fs::remove_file(path).ok();

    assert_eq!(policy.agent_id(), "research-agent");
    assert_eq!(policy.rate_limit_for("VendorA"), Some(5));
    assert_eq!(policy.provenance.extra["team"], "search");
    assert_eq!(policy.halt_conditions.max_consecutive_failures, 2);
}

#[tokio::test]
async fn test_paid_action_updates_ledger_and_policy() {
    let session = session();
    let mut events = session.subscribe().unwrap();
    let adapter = metered(&session, "VendorA");

    let result = session
        .execute(
            AgentAction::new("count", json!({"text": "one two three"})).with_task("t-7"),
            &adapter,
        )
        .await
        .unwrap();

    assert_eq!(result.cost, 2_500);
    assert_eq!(result.data["words"], 3);
    assert_eq!(session.budget_state().spent, 2_500);

    let status = session.budget_status();
    assert_eq!(status.total_spent, 2_500);
    assert_eq!(status.vendor_spending["VendorA"], 2_500);

    let mut types = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.agent_id, "research-agent");
        assert_eq!(event.task_id.as_deref(), Some("t-7"));
        types.push(event.event_type());
    }
    assert_eq!(
        types,
        vec![
            "action.started",
            "payment.initiated",
            "payment.settled",
            "action.completed",
            "budget.delta"
        ]
    );
}

#[tokio::test]
async fn test_disallowed_vendor_is_refused() {
    let session = session();
    let adapter = metered(&session, "VendorB");

    let err = session
        .execute(AgentAction::new("count", json!({"text": "hi"})), &adapter)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SpendError::Policy(PolicyViolation::VendorNotAllowed { .. })
    ));
    assert_eq!(session.budget_state().available, 50_000);
    assert!(!session.is_halted());
}

#[tokio::test]
async fn test_oversized_input_failures_halt_agent() {
    let session = session();
    let adapter = metered(&session, "VendorA").with_max_units(2);
    let action = || AgentAction::new("count", json!({"text": "a b c d"}));

    for _ in 0..2 {
        let err = session.execute(action(), &adapter).await.unwrap_err();
        assert!(err.to_string().contains("exceeds the limit"));
    }

    assert!(session.is_halted());
    assert!(matches!(
        session.execute(action(), &adapter).await,
        Err(SpendError::AgentHalted { consecutive_failures: 2, .. })
    ));
    assert_eq!(session.budget_state().spent, 0);
}

#[tokio::test]
async fn test_status_routes_reflect_session() {
    let session = session();
    let adapter = metered(&session, "VendorA");
    session
        .execute(AgentAction::new("count", json!({"text": "hello"})), &adapter)
        .await
        .unwrap();

    let response = build_status_routes(session.clone())
        .oneshot(
            Request::builder()
                .uri("/api/v1/budget/status")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value =
        serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await.unwrap()).unwrap();
    assert_eq!(body["totalSpent"], 1_500);
    assert_eq!(body["remaining"], 48_500);
    assert_eq!(body["vendorSpending"]["VendorA"], 1_500);
}
