//! Telemetry sinks

use super::{TelemetryEmitter, TelemetryError, TelemetryEvent};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// Keeps every event in memory, in emission order
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events of one type, e.g. `budget.delta`
    pub fn of_type(&self, event_type: &str) -> Vec<TelemetryEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }

    /// Event types in emission order
    pub fn types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.event_type())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl TelemetryEmitter for MemoryEmitter {
    async fn emit(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
        Ok(())
    }
}

/// Writes each event as one structured log line
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

#[async_trait]
impl TelemetryEmitter for TracingEmitter {
    async fn emit(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        let payload = serde_json::to_string(&event.payload)?;
        info!(
            target: "spend_control::telemetry",
            event_type = event.event_type(),
            correlation_id = %event.correlation_id,
            agent_id = %event.agent_id,
            task_id = event.task_id.as_deref().unwrap_or(""),
            payload = %payload,
            "telemetry"
        );
        Ok(())
    }
}

/// Publishes events to live subscribers. Having no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct BroadcastEmitter {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl TelemetryEmitter for BroadcastEmitter {
    async fn emit(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        // send only fails when nobody is listening
        let _ = self.sender.send(event);
        Ok(())
    }
}

/// Delivers every event to each inner sink. All sinks are attempted; the
/// first failure is reported afterwards.
#[derive(Default, Clone)]
pub struct FanoutEmitter {
    sinks: Vec<Arc<dyn TelemetryEmitter>>,
}

impl FanoutEmitter {
    pub fn new(sinks: Vec<Arc<dyn TelemetryEmitter>>) -> Self {
        Self { sinks }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetryEmitter>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl TelemetryEmitter for FanoutEmitter {
    async fn emit(&self, event: TelemetryEvent) -> Result<(), TelemetryError> {
        let results = join_all(self.sinks.iter().map(|sink| sink.emit(event.clone()))).await;
        results.into_iter().collect()
    }
}
