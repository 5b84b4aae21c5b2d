//! Circuit breaker in front of the settlement facilitator
//!
//! Tracked per key (operation or vendor). After `failure_threshold`
//! consecutive failures the key opens and calls fail fast until
//! `reset_timeout` passes, then a single probe is let through.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Whether calls for `key` should be refused right now. An open key whose
    /// reset timeout has passed moves to half-open and admits the caller.
    pub fn is_open(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let cooled = entry
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if cooled {
                    entry.state = BreakerState::HalfOpen;
                }
                !cooled
            }
        }
    }

    pub fn mark_success(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn mark_failure(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(key.to_string()).or_default();

        entry.consecutive_failures += 1;

        // A failed probe reopens immediately
        let reopen = entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold;
        if reopen && entry.state != BreakerState::Open {
            warn!(
                key,
                failures = entry.consecutive_failures,
                "Circuit breaker opened"
            );
        }
        if reopen {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self, key: &str) -> BreakerState {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn failures(&self, key: &str) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).map(|e| e.consecutive_failures).unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
