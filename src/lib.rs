//! Spending control for autonomous agents that pay per call
//!
//! A [`budget::BudgetManager`] holds a reservation ledger against a capped,
//! time-windowed budget. A [`policy::PolicyEngine`] enforces vendor, rate and
//! cap rules. The [`executor::AgentExecutor`] runs each paid action through
//! estimate, reserve, execute and commit or release, emitting auditable
//! [`telemetry::TelemetryEvent`]s along the way.

pub mod adapter;
pub mod api;
pub mod budget;
pub mod config;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod payment;
pub mod policy;
pub mod session;
pub mod telemetry;

pub use adapter::{AdapterContext, AdapterError, AdapterResult, ServiceAdapter};
pub use budget::{BudgetError, BudgetManager, BudgetState};
pub use config::SpendConfig;
pub use error::{Result, SpendError};
pub use executor::{AgentAction, AgentExecutor, HaltMonitor};
pub use payment::{PaymentClient, PaymentReceipt, PaymentRequest};
pub use policy::{PaymentPolicy, PolicyEngine, PolicyViolation};
pub use session::AgentSession;
pub use telemetry::{EventPayload, TelemetryEmitter, TelemetryEvent};
