//! Action execution: reservation lifecycle and halt tracking

pub mod action;
pub mod agent;
pub mod halt;

pub use action::{ActionPriority, ActionState, AgentAction};
pub use agent::AgentExecutor;
pub use halt::HaltMonitor;
