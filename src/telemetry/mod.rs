//! Auditable telemetry for agent spending
//!
//! The core builds well-formed [`TelemetryEvent`]s and hands them to a
//! [`TelemetryEmitter`]. Sink failures are logged and never change the
//! outcome of an action.

pub mod events;
pub mod sinks;

use crate::metrics::METRICS;
use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub use events::{EventPayload, EventScope, TelemetryEvent};
pub use sinks::{BroadcastEmitter, FanoutEmitter, MemoryEmitter, TracingEmitter};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Telemetry sink closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink error: {0}")]
    Sink(String),
}

/// Destination for telemetry events
#[async_trait]
pub trait TelemetryEmitter: Send + Sync {
    async fn emit(&self, event: TelemetryEvent) -> Result<(), TelemetryError>;
}

/// Emit an event, logging instead of propagating a sink failure
pub async fn emit_logged(emitter: &dyn TelemetryEmitter, event: TelemetryEvent) {
    let event_type = event.event_type();
    let correlation_id = event.correlation_id.clone();

    if let Err(e) = emitter.emit(event).await {
        METRICS.record_sink_error();
        warn!(
            event_type,
            correlation_id = %correlation_id,
            "Failed to emit telemetry event: {}",
            e
        );
    }
}
