//! Halts an agent after repeated failures

use crate::error::{Result, SpendError};
use crate::policy::HaltConditions;
use crate::telemetry::{emit_logged, EventPayload, EventScope, TelemetryEmitter};
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Tracks consecutive failures per agent.
///
/// Once an agent reaches `max_consecutive_failures` it stays halted until
/// [`HaltMonitor::reset`] is called. A limit of 0 disables halting.
pub struct HaltMonitor {
    max_consecutive_failures: u32,
    streaks: DashMap<String, u32>,
    halted: DashSet<String>,
    emitter: Arc<dyn TelemetryEmitter>,
}

impl HaltMonitor {
    pub fn new(conditions: &HaltConditions, emitter: Arc<dyn TelemetryEmitter>) -> Self {
        Self {
            max_consecutive_failures: conditions.max_consecutive_failures,
            streaks: DashMap::new(),
            halted: DashSet::new(),
            emitter,
        }
    }

    /// Refuse if the agent is halted
    pub fn check(&self, agent_id: &str) -> Result<()> {
        if self.halted.contains(agent_id) {
            return Err(SpendError::AgentHalted {
                agent_id: agent_id.to_string(),
                consecutive_failures: self.consecutive_failures(agent_id),
            });
        }
        Ok(())
    }

    pub fn record_success(&self, agent_id: &str) {
        self.streaks.remove(agent_id);
    }

    /// Count a failure. Returns true if this failure halted the agent, in
    /// which case `agent.halted` has been emitted.
    pub async fn record_failure(&self, scope: &EventScope, reason: &str) -> bool {
        let streak = {
            let mut entry = self.streaks.entry(scope.agent_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if self.max_consecutive_failures == 0 || streak < self.max_consecutive_failures {
            return false;
        }
        if !self.halted.insert(scope.agent_id.clone()) {
            return false;
        }

        warn!(
            agent_id = %scope.agent_id,
            consecutive_failures = streak,
            "Agent halted: {}",
            reason
        );
        emit_logged(
            self.emitter.as_ref(),
            scope.event(EventPayload::AgentHalted {
                reason: reason.to_string(),
                consecutive_failures: streak,
                max_consecutive_failures: self.max_consecutive_failures,
            }),
        )
        .await;
        true
    }

    pub fn is_halted(&self, agent_id: &str) -> bool {
        self.halted.contains(agent_id)
    }

    pub fn consecutive_failures(&self, agent_id: &str) -> u32 {
        self.streaks.get(agent_id).map(|s| *s).unwrap_or(0)
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    /// Lift a halt and clear the failure streak
    pub fn reset(&self, agent_id: &str) {
        self.streaks.remove(agent_id);
        if self.halted.remove(agent_id).is_some() {
            info!(agent_id, "Agent halt lifted");
        }
    }
}
