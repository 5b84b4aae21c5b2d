//! Executor running paid actions against the budget ledger

use super::action::{ActionState, AgentAction};
use crate::adapter::{AdapterContext, AdapterResult, ServiceAdapter};
use crate::budget::{BudgetError, BudgetManager};
use crate::error::{Result, SpendError};
use crate::metrics::METRICS;
use crate::policy::{PolicyEngine, Provenance};
use crate::telemetry::{emit_logged, EventPayload, EventScope, TelemetryEmitter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs actions through estimate, reserve, execute and commit or release.
///
/// Refusals (budget, policy) happen before any reservation or telemetry.
/// Once an action has started, exactly one `action.completed` is emitted for
/// it, and adapter errors are returned unchanged. There are no retries.
/// Dropping the `execute` future mid-flight releases the hold as well.
pub struct AgentExecutor {
    budget: Arc<BudgetManager>,
    policy: Option<Arc<PolicyEngine>>,
    emitter: Arc<dyn TelemetryEmitter>,
    provenance: Provenance,
    settlement_timeout: Option<Duration>,
}

impl AgentExecutor {
    pub fn new(
        budget: Arc<BudgetManager>,
        emitter: Arc<dyn TelemetryEmitter>,
        provenance: Provenance,
    ) -> Self {
        Self {
            budget,
            policy: None,
            emitter,
            provenance,
            settlement_timeout: None,
        }
    }

    /// Check vendors against `policy`, record settled spend with it, and
    /// enforce its settlement timeout
    pub fn with_policy(mut self, policy: Arc<PolicyEngine>) -> Self {
        self.settlement_timeout = policy.get_policy().halt_conditions.settlement_timeout();
        self.policy = Some(policy);
        self
    }

    /// Deadline for the adapter call; `None` waits indefinitely
    pub fn with_settlement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settlement_timeout = timeout;
        self
    }

    pub fn budget(&self) -> &Arc<BudgetManager> {
        &self.budget
    }

    pub fn policy(&self) -> Option<&Arc<PolicyEngine>> {
        self.policy.as_ref()
    }

    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    /// Run an action under a freshly minted correlation id
    pub async fn execute(
        &self,
        action: AgentAction,
        adapter: &dyn ServiceAdapter,
    ) -> Result<AdapterResult> {
        let correlation_id = Uuid::new_v4().to_string();
        self.execute_with_id(&correlation_id, action, adapter).await
    }

    /// Run an action under a caller-chosen correlation id, which must not
    /// belong to an outstanding reservation
    pub async fn execute_with_id(
        &self,
        correlation_id: &str,
        action: AgentAction,
        adapter: &dyn ServiceAdapter,
    ) -> Result<AdapterResult> {
        let AgentAction {
            action_type,
            input,
            estimated_cost,
            priority,
            task_id,
            sla_ms,
        } = action;

        trace_state(correlation_id, ActionState::Initiated);
        let estimated = estimated_cost.unwrap_or_else(|| adapter.estimate_cost(&input));
        trace_state(correlation_id, ActionState::Estimated);

        if !self.budget.can_afford(estimated) {
            METRICS.record_refused_action("insufficient_budget");
            let available = self.budget.available();
            info!(
                correlation_id,
                action_type = %action_type,
                estimated,
                available,
                "Action refused: insufficient budget"
            );
            return Err(BudgetError::InsufficientBudget {
                requested: estimated,
                available,
            }
            .into());
        }

        let mut admitted = None;
        if let (Some(policy), Some(vendor)) = (&self.policy, adapter.vendor()) {
            if let Err(violation) = policy.check_spend(estimated, vendor) {
                METRICS.record_refused_action("policy_denied");
                info!(
                    correlation_id,
                    vendor,
                    reason = violation.reason(),
                    "Action refused by policy"
                );
                return Err(violation.into());
            }
            admitted = Some((policy, vendor));
        }
        trace_state(correlation_id, ActionState::BudgetChecked);

        // Re-checks availability under the ledger lock
        if let Err(e) = self.budget.reserve(correlation_id, estimated) {
            if let Some((policy, vendor)) = admitted {
                policy.refund_request(vendor);
            }
            METRICS.record_refused_action(match e {
                BudgetError::InsufficientBudget { .. } => "insufficient_budget",
                _ => "duplicate_reservation",
            });
            info!(correlation_id, "Action refused at reservation: {}", e);
            return Err(e.into());
        }
        trace_state(correlation_id, ActionState::Reserved);

        let scope = EventScope::new(correlation_id, self.provenance.clone()).with_task(task_id);
        let mut in_flight = InFlight {
            budget: self.budget.clone(),
            emitter: self.emitter.clone(),
            scope: scope.clone(),
            action_type: action_type.clone(),
            adapter: adapter.name().to_string(),
            start: Instant::now(),
            committed: None,
            armed: true,
        };

        self.emit(
            &scope,
            EventPayload::ActionStarted {
                action_type: action_type.clone(),
                input: input.clone(),
                estimated_cost: estimated,
            },
        )
        .await;

        info!(
            correlation_id,
            action_type = %action_type,
            adapter = adapter.name(),
            priority = ?priority.unwrap_or_default(),
            estimated,
            "Action started"
        );
        trace_state(correlation_id, ActionState::Running);

        let ctx = AdapterContext::new(scope.clone(), self.budget.available(), self.emitter.clone());
        let start = Instant::now();
        let outcome = self.run_adapter(correlation_id, adapter, input, &ctx).await;
        let duration = start.elapsed();

        match outcome {
            Ok(result) => {
                self.settle(correlation_id, estimated, &result);
                in_flight.committed = Some(result.cost);
                trace_state(correlation_id, ActionState::Committed);

                self.emit(
                    &scope,
                    EventPayload::ActionCompleted {
                        action_type: action_type.clone(),
                        output: Some(result.data.clone()),
                        actual_cost: result.cost,
                        duration_ms: duration_ms(duration),
                        success: true,
                        error: None,
                    },
                )
                .await;
                in_flight.armed = false;
                self.emit_budget_delta(&scope, "commit", result.cost).await;

                if let Some(target_ms) = sla_ms {
                    let actual_ms = duration_ms(duration);
                    self.emit(
                        &scope,
                        EventPayload::SlaOutcome {
                            action_type: action_type.clone(),
                            target_ms,
                            actual_ms,
                            met: actual_ms <= target_ms,
                        },
                    )
                    .await;
                }

                METRICS.record_action(adapter.name(), "success", duration);
                info!(
                    correlation_id,
                    action_type = %action_type,
                    cost = result.cost,
                    "Action completed in {:?}",
                    duration
                );
                Ok(result)
            }
            Err(e) => {
                let released = self.budget.release(correlation_id).unwrap_or(0);
                trace_state(correlation_id, ActionState::Released);

                self.emit(
                    &scope,
                    EventPayload::ActionCompleted {
                        action_type: action_type.clone(),
                        output: None,
                        actual_cost: 0,
                        duration_ms: duration_ms(duration),
                        success: false,
                        error: Some(e.to_string()),
                    },
                )
                .await;
                in_flight.armed = false;
                self.emit_budget_delta(&scope, "release", released).await;

                let status = match e {
                    SpendError::SettlementTimeout { .. } => "timeout",
                    _ => "failure",
                };
                METRICS.record_action(adapter.name(), status, duration);
                warn!(
                    correlation_id,
                    action_type = %action_type,
                    "Action failed after {:?}: {}",
                    duration,
                    e
                );
                Err(e)
            }
        }
    }

    async fn run_adapter(
        &self,
        correlation_id: &str,
        adapter: &dyn ServiceAdapter,
        input: serde_json::Value,
        ctx: &AdapterContext,
    ) -> Result<AdapterResult> {
        match self.settlement_timeout {
            Some(limit) => match tokio::time::timeout(limit, adapter.execute(input, ctx)).await {
                Ok(result) => result.map_err(SpendError::from),
                Err(_) => Err(SpendError::SettlementTimeout {
                    correlation_id: correlation_id.to_string(),
                    timeout_ms: duration_ms(limit),
                }),
            },
            None => adapter.execute(input, ctx).await.map_err(SpendError::from),
        }
    }

    /// Commit the reservation and record the spend with the policy engine
    fn settle(&self, correlation_id: &str, estimated: u64, result: &AdapterResult) {
        if result.cost > estimated {
            warn!(
                correlation_id,
                estimated,
                actual = result.cost,
                "Actual cost exceeded the reservation"
            );
        }

        match self.budget.commit(correlation_id, result.cost) {
            Ok(()) => {}
            Err(BudgetError::UnknownReservation(_)) => {
                // The window rolled over while the call was running
                warn!(
                    correlation_id,
                    "Reservation gone at commit, recording spend directly"
                );
                self.budget.record_unreserved(result.cost);
            }
            Err(e) => warn!(correlation_id, "Commit failed: {}", e),
        }

        if let (Some(policy), Some(receipt)) = (&self.policy, &result.receipt) {
            policy.record_spend(receipt);
        }
    }

    async fn emit_budget_delta(&self, scope: &EventScope, reason: &str, amount: u64) {
        let state = self.budget.get_state();
        self.emit(
            scope,
            EventPayload::BudgetDelta {
                reason: reason.to_string(),
                amount,
                spent: state.spent,
                reserved: state.reserved,
                available: state.available,
                cap: state.cap,
            },
        )
        .await;
    }

    async fn emit(&self, scope: &EventScope, payload: EventPayload) {
        emit_logged(self.emitter.as_ref(), scope.event(payload)).await;
    }
}

/// Resolves an action whose `execute` future is dropped mid-flight, e.g. by
/// a caller's own timeout or `select!`.
///
/// Armed once the hold is placed and disarmed after `action.completed` has
/// been emitted. Dropping it while armed releases the hold (a no-op after a
/// commit) and emits the missing completion from a spawned task.
struct InFlight {
    budget: Arc<BudgetManager>,
    emitter: Arc<dyn TelemetryEmitter>,
    scope: EventScope,
    action_type: String,
    adapter: String,
    start: Instant,
    committed: Option<u64>,
    armed: bool,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let correlation_id = self.scope.correlation_id.clone();
        let released = self.budget.release(&correlation_id).unwrap_or(0);
        let duration = self.start.elapsed();
        METRICS.record_action(&self.adapter, "cancelled", duration);
        warn!(
            correlation_id = %correlation_id,
            released,
            "Action dropped before completion"
        );

        let completed = self.scope.event(EventPayload::ActionCompleted {
            action_type: std::mem::take(&mut self.action_type),
            output: None,
            actual_cost: self.committed.unwrap_or(0),
            duration_ms: duration_ms(duration),
            success: self.committed.is_some(),
            error: self.committed.is_none().then(|| "cancelled".to_string()),
        });
        let state = self.budget.get_state();
        let (reason, amount) = match self.committed {
            Some(cost) => ("commit", cost),
            None => ("release", released),
        };
        let delta = self.scope.event(EventPayload::BudgetDelta {
            reason: reason.to_string(),
            amount,
            spent: state.spent,
            reserved: state.reserved,
            available: state.available,
            cap: state.cap,
        });

        let emitter = self.emitter.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    emit_logged(emitter.as_ref(), completed).await;
                    emit_logged(emitter.as_ref(), delta).await;
                });
            }
            Err(_) => warn!(
                correlation_id = %correlation_id,
                "No runtime left to emit the dropped action's completion"
            ),
        }
    }
}

fn trace_state(correlation_id: &str, state: ActionState) {
    debug!(correlation_id, state = state.as_str(), "Action state");
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
