//! Actions an agent asks the executor to run

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// One paid step an agent wants to take
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentAction {
    #[serde(rename = "type")]
    pub action_type: String,

    #[serde(default)]
    pub input: Value,

    /// Overrides the adapter's own estimate, in lamports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<ActionPriority>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Latency target in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_ms: Option<u64>,
}

impl AgentAction {
    pub fn new(action_type: impl Into<String>, input: Value) -> Self {
        Self {
            action_type: action_type.into(),
            input,
            estimated_cost: None,
            priority: None,
            task_id: None,
            sla_ms: None,
        }
    }

    pub fn with_estimated_cost(mut self, lamports: u64) -> Self {
        self.estimated_cost = Some(lamports);
        self
    }

    pub fn with_priority(mut self, priority: ActionPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_sla_ms(mut self, sla_ms: u64) -> Self {
        self.sla_ms = Some(sla_ms);
        self
    }
}

/// Lifecycle of one `execute` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Initiated,
    Estimated,
    BudgetChecked,
    Reserved,
    Running,
    Committed,
    Released,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed | Self::Released)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Estimated => "estimated",
            Self::BudgetChecked => "budget_checked",
            Self::Reserved => "reserved",
            Self::Running => "running",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_deserializes_wire_shape() {
        let action: AgentAction = serde_json::from_value(json!({
            "type": "search",
            "input": {"q": "rust"},
            "estimatedCost": 5000,
            "priority": "high",
            "taskId": "t-1",
            "slaMs": 250
        }))
        .unwrap();

        assert_eq!(action.action_type, "search");
        assert_eq!(action.estimated_cost, Some(5_000));
        assert_eq!(action.priority, Some(ActionPriority::High));
        assert_eq!(action.task_id.as_deref(), Some("t-1"));
        assert_eq!(action.sla_ms, Some(250));
    }

    #[test]
    fn test_optional_fields_omitted() {
        let value = serde_json::to_value(AgentAction::new("search", json!({}))).unwrap();
        assert_eq!(value, json!({"type": "search", "input": {}}));
    }

    #[test]
    fn test_terminal_states() {
        assert!(ActionState::Committed.is_terminal());
        assert!(ActionState::Released.is_terminal());
        assert!(!ActionState::Running.is_terminal());
        assert!(ActionPriority::Critical > ActionPriority::Low);
    }
}
