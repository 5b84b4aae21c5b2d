//! One agent's spending components, wired from a payment policy

use crate::adapter::{AdapterResult, ServiceAdapter};
use crate::budget::{BudgetManager, BudgetState, BudgetWindow, Clock, SystemClock};
use crate::config::{PaymentBackend, SpendConfig};
use crate::error::Result;
use crate::executor::{AgentAction, AgentExecutor, HaltMonitor};
use crate::payment::{HttpPaymentClient, MockPaymentClient, PaymentClient};
use crate::policy::{BudgetStatus, PaymentPolicy, PolicyEngine};
use crate::telemetry::{
    BroadcastEmitter, EventScope, FanoutEmitter, TelemetryEmitter, TelemetryEvent, TracingEmitter,
};
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// Budget ledger, policy engine, executor and halt monitor for one agent.
///
/// The ledger and the policy engine share one [`BudgetWindow`], so they
/// always roll over together.
pub struct AgentSession {
    budget: Arc<BudgetManager>,
    policy: Arc<PolicyEngine>,
    executor: AgentExecutor,
    halt: HaltMonitor,
    emitter: Arc<dyn TelemetryEmitter>,
    broadcast: Option<BroadcastEmitter>,
    payment_client: Option<Arc<dyn PaymentClient>>,
}

impl AgentSession {
    pub fn new(policy: PaymentPolicy, emitter: Arc<dyn TelemetryEmitter>) -> Self {
        Self::with_clock(policy, emitter, Arc::new(SystemClock))
    }

    /// Build a session whose window runs on `clock`
    pub fn with_clock(
        policy: PaymentPolicy,
        emitter: Arc<dyn TelemetryEmitter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let window = Arc::new(BudgetWindow::new(clock, policy.budget_window));
        let budget = Arc::new(BudgetManager::new(policy.budget_cap, window.clone()));
        Self::assemble(policy, budget, window, emitter)
    }

    fn assemble(
        policy: PaymentPolicy,
        budget: Arc<BudgetManager>,
        window: Arc<BudgetWindow>,
        emitter: Arc<dyn TelemetryEmitter>,
    ) -> Self {
        let halt = HaltMonitor::new(&policy.halt_conditions, emitter.clone());
        let provenance = policy.provenance.clone();
        let engine = Arc::new(PolicyEngine::new(policy, window));
        let executor =
            AgentExecutor::new(budget.clone(), emitter.clone(), provenance).with_policy(engine.clone());

        Self {
            budget,
            policy: engine,
            executor,
            halt,
            emitter,
            broadcast: None,
            payment_client: None,
        }
    }

    /// Build a session from runtime configuration.
    ///
    /// Requires `policy_path`. Events go to a live broadcast stream, and to
    /// the log when `telemetry.log_events` is set.
    pub fn from_config(config: &SpendConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let policy = config
            .load_policy()?
            .context("policy_path must be set to build a session")?;

        let broadcast = BroadcastEmitter::new(config.telemetry.broadcast_capacity);
        let live: Arc<dyn TelemetryEmitter> = Arc::new(broadcast.clone());
        let mut fanout = FanoutEmitter::new(vec![live]);
        if config.telemetry.log_events {
            fanout = fanout.with_sink(Arc::new(TracingEmitter));
        }

        let payment_client: Arc<dyn PaymentClient> = match config.payment_backend {
            PaymentBackend::Mock => Arc::new(
                MockPaymentClient::new(config.payment.sol_price_usd)
                    .with_network(config.payment.network.clone()),
            ),
            PaymentBackend::Facilitator => Arc::new(
                HttpPaymentClient::new(config.payment.clone())
                    .context("failed to build facilitator client")?,
            ),
        };

        let window = Arc::new(BudgetWindow::new(Arc::new(SystemClock), policy.budget_window));
        let budget = Arc::new(
            BudgetManager::new(policy.budget_cap, window.clone())
                .with_carry_reservations(config.ledger.carry_reservations),
        );

        info!(
            agent_id = %policy.agent_id(),
            budget_cap = policy.budget_cap,
            budget_window = policy.budget_window,
            backend = ?config.payment_backend,
            "Agent session ready"
        );

        let mut session = Self::assemble(policy, budget, window, Arc::new(fanout));
        session.broadcast = Some(broadcast);
        session.payment_client = Some(payment_client);
        Ok(session)
    }

    /// Run an action unless the agent is halted.
    ///
    /// Refusals (budget, policy, halt) do not count toward the failure
    /// streak; adapter errors and timeouts do.
    pub async fn execute(
        &self,
        action: AgentAction,
        adapter: &dyn ServiceAdapter,
    ) -> Result<AdapterResult> {
        let agent_id = self.agent_id().to_string();
        self.halt.check(&agent_id)?;

        let correlation_id = Uuid::new_v4().to_string();
        let task_id = action.task_id.clone();

        let outcome = self
            .executor
            .execute_with_id(&correlation_id, action, adapter)
            .await;

        match outcome {
            Ok(result) => {
                self.halt.record_success(&agent_id);
                Ok(result)
            }
            Err(e) => {
                if !e.is_refusal() {
                    let provenance = self.policy.get_policy().provenance.clone();
                    let scope = EventScope::new(correlation_id, provenance).with_task(task_id);
                    self.halt.record_failure(&scope, &e.to_string()).await;
                }
                Err(e)
            }
        }
    }

    pub fn budget(&self) -> &Arc<BudgetManager> {
        &self.budget
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn executor(&self) -> &AgentExecutor {
        &self.executor
    }

    pub fn halt_monitor(&self) -> &HaltMonitor {
        &self.halt
    }

    pub fn emitter(&self) -> &Arc<dyn TelemetryEmitter> {
        &self.emitter
    }

    /// Payment client chosen by configuration, for building adapters
    pub fn payment_client(&self) -> Option<Arc<dyn PaymentClient>> {
        self.payment_client.clone()
    }

    pub fn agent_id(&self) -> &str {
        self.policy.get_policy().agent_id()
    }

    pub fn budget_state(&self) -> BudgetState {
        self.budget.get_state()
    }

    pub fn budget_status(&self) -> BudgetStatus {
        self.policy.get_budget_status()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted(self.agent_id())
    }

    /// Live event stream, available on sessions built from configuration
    pub fn subscribe(&self) -> Option<broadcast::Receiver<TelemetryEvent>> {
        self.broadcast.as_ref().map(BroadcastEmitter::subscribe)
    }
}
