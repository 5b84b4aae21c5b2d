//! Wall-clock source and the budget window shared by the ledger and policy engine

use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Source of wall-clock time in epoch milliseconds
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Start at the current system time
    pub fn starting_now() -> Self {
        Self::new(Utc::now().timestamp_millis())
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Convert epoch milliseconds into a UTC timestamp
pub(crate) fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Bounds of the active window plus a counter of how many times it rolled over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSnapshot {
    pub start_ms: i64,
    pub end_ms: i64,
    pub epoch: u64,
}

impl WindowSnapshot {
    pub fn start(&self) -> DateTime<Utc> {
        to_datetime(self.start_ms)
    }

    pub fn end(&self) -> DateTime<Utc> {
        to_datetime(self.end_ms)
    }
}

#[derive(Debug)]
struct WindowState {
    start_ms: i64,
    epoch: u64,
}

/// Time window over which spend and request counters accumulate.
///
/// The window rolls lazily: the first access after `now - start` exceeds the
/// window length starts a new window at `now` and bumps the epoch. Components
/// holding the same `Arc<BudgetWindow>` observe the same epoch and therefore
/// reset together.
pub struct BudgetWindow {
    clock: Arc<dyn Clock>,
    length_ms: i64,
    state: Mutex<WindowState>,
}

impl BudgetWindow {
    pub fn new(clock: Arc<dyn Clock>, window_secs: u64) -> Self {
        let start_ms = clock.now_ms();
        Self {
            clock,
            length_ms: (window_secs as i64).saturating_mul(1000),
            state: Mutex::new(WindowState { start_ms, epoch: 0 }),
        }
    }

    /// Window driven by the system clock
    pub fn system(window_secs: u64) -> Self {
        Self::new(Arc::new(SystemClock), window_secs)
    }

    /// Current window, rolling it over first if it has expired
    pub fn current(&self) -> WindowSnapshot {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if now - state.start_ms > self.length_ms {
            debug!(
                previous_start = state.start_ms,
                new_start = now,
                "Budget window expired, starting a new one"
            );
            state.start_ms = now;
            state.epoch += 1;
        }

        WindowSnapshot {
            start_ms: state.start_ms,
            end_ms: state.start_ms.saturating_add(self.length_ms),
            epoch: state.epoch,
        }
    }

    pub fn length(&self) -> Duration {
        Duration::from_millis(self.length_ms.max(0) as u64)
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}

impl std::fmt::Debug for BudgetWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetWindow")
            .field("length_ms", &self.length_ms)
            .finish_non_exhaustive()
    }
}
