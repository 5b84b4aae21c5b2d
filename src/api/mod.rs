//! Read-only status API for a running agent session

use crate::budget::BudgetState;
use crate::metrics::METRICS;
use crate::policy::{BudgetStatus, PaymentPolicy};
use crate::session::AgentSession;
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Request bodies are never read; anything larger is refused early
const MAX_BODY_BYTES: usize = 4 * 1024;

#[derive(Clone)]
pub struct StatusState {
    pub session: Arc<AgentSession>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HaltStatus {
    pub agent_id: String,
    pub halted: bool,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
}

/// Build the status routes
pub fn build_status_routes(session: Arc<AgentSession>) -> Router {
    Router::new()
        .route("/api/v1/budget", get(get_budget))
        .route("/api/v1/budget/status", get(get_budget_status))
        .route("/api/v1/policy", get(get_policy))
        .route("/api/v1/halt", get(get_halt))
        .route("/metrics", get(get_metrics))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(StatusState { session })
}

/// Ledger snapshot
async fn get_budget(State(state): State<StatusState>) -> Json<BudgetState> {
    Json(state.session.budget_state())
}

/// Settled spend grouped by vendor
async fn get_budget_status(State(state): State<StatusState>) -> Json<BudgetStatus> {
    Json(state.session.budget_status())
}

async fn get_policy(State(state): State<StatusState>) -> Json<PaymentPolicy> {
    Json(state.session.policy().get_policy().clone())
}

async fn get_halt(State(state): State<StatusState>) -> Json<HaltStatus> {
    let agent_id = state.session.agent_id().to_string();
    let monitor = state.session.halt_monitor();

    Json(HaltStatus {
        halted: monitor.is_halted(&agent_id),
        consecutive_failures: monitor.consecutive_failures(&agent_id),
        max_consecutive_failures: monitor.max_consecutive_failures(),
        agent_id,
    })
}

/// Prometheus text exposition
async fn get_metrics() -> impl IntoResponse {
    debug!("Serving metrics");
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.export_prometheus(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemoryEmitter;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    fn router() -> Router {
        let policy = PaymentPolicy::new("agent-1", 5_000, 3600).allow_vendor("V1");
        let session = AgentSession::new(policy, Arc::new(MemoryEmitter::new()));
        session.budget().reserve("corr-1", 1_000).unwrap();
        build_status_routes(Arc::new(session))
    }

    async fn get_json(router: Router, uri: &str) -> Value {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_budget_snapshot() {
        let body = get_json(router(), "/api/v1/budget").await;
        assert_eq!(body["cap"], 5_000);
        assert_eq!(body["reserved"], 1_000);
        assert_eq!(body["available"], 4_000);
    }

    #[tokio::test]
    async fn test_policy_and_halt() {
        let policy = get_json(router(), "/api/v1/policy").await;
        assert_eq!(policy["budgetCap"], 5_000);
        assert_eq!(policy["allowedVendors"][0], "V1");

        let halt = get_json(router(), "/api/v1/halt").await;
        assert_eq!(halt["agentId"], "agent-1");
        assert_eq!(halt["halted"], false);
        assert_eq!(halt["maxConsecutiveFailures"], 3);
    }

    #[tokio::test]
    async fn test_budget_status_and_metrics() {
        let status = get_json(router(), "/api/v1/budget/status").await;
        assert_eq!(status["totalSpent"], 0);
        assert_eq!(status["remaining"], 5_000);

        let response = router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = router()
            .oneshot(Request::builder().uri("/api/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
