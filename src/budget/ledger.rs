//! Reservation ledger enforcing a capped, time-windowed spend budget
//!
//! Every action holds budget before it runs and resolves the hold exactly once:
//! - `reserve`: place a hold, refused when it does not fit in `available`
//! - `commit`: turn a hold into spend using the actual cost
//! - `release`: drop a hold without spending (safe to repeat)
//!
//! All ledger mutations happen under one mutex, so the availability check and
//! the insert in `reserve` are a single atomic step for concurrent callers.

use super::clock::{BudgetWindow, WindowSnapshot};
use super::models::{BudgetState, Reservation};
use crate::metrics::METRICS;
use crate::policy::PaymentPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Ledger errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BudgetError {
    #[error("Insufficient budget: need {requested} lamports, have {available} lamports")]
    InsufficientBudget { requested: u64, available: u64 },

    #[error("Unknown reservation: {0}")]
    UnknownReservation(String),

    #[error("Reservation already exists: {0}")]
    DuplicateReservation(String),
}

#[derive(Debug, Default)]
struct Ledger {
    epoch: u64,
    spent: u64,
    reservations: HashMap<String, u64>,
}

impl Ledger {
    fn reserved(&self) -> u64 {
        self.reservations
            .values()
            .fold(0u64, |acc, amount| acc.saturating_add(*amount))
    }

    fn available(&self, cap: u64) -> u64 {
        cap.saturating_sub(self.spent.saturating_add(self.reserved()))
    }
}

/// Budget manager for one agent session
pub struct BudgetManager {
    cap: u64,
    window: Arc<BudgetWindow>,
    carry_reservations: bool,
    ledger: Mutex<Ledger>,
}

impl BudgetManager {
    /// Create a manager over an existing window
    pub fn new(cap: u64, window: Arc<BudgetWindow>) -> Self {
        let epoch = window.current().epoch;
        Self {
            cap,
            window,
            carry_reservations: false,
            ledger: Mutex::new(Ledger {
                epoch,
                ..Ledger::default()
            }),
        }
    }

    /// Create a manager with its own system-clock window from a policy
    pub fn from_policy(policy: &PaymentPolicy) -> Self {
        Self::new(
            policy.budget_cap,
            Arc::new(BudgetWindow::system(policy.budget_window)),
        )
    }

    /// Keep outstanding reservations when the window rolls over instead of
    /// dropping them
    pub fn with_carry_reservations(mut self, carry: bool) -> Self {
        self.carry_reservations = carry;
        self
    }

    /// Lock the ledger, applying a window rollover first if one is due
    fn lock_current(&self) -> (MutexGuard<'_, Ledger>, WindowSnapshot) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        let window = self.window.current();

        if window.epoch != ledger.epoch {
            let dropped = if self.carry_reservations {
                0
            } else {
                let count = ledger.reservations.len();
                ledger.reservations.clear();
                count
            };

            info!(
                spent = ledger.spent,
                dropped_reservations = dropped,
                "Budget window reset"
            );
            if dropped > 0 {
                warn!(
                    "{} in-flight reservations dropped by window reset",
                    dropped
                );
            }

            ledger.spent = 0;
            ledger.epoch = window.epoch;
        }

        (ledger, window)
    }

    /// Whether `estimated_cost` fits in the currently available budget
    pub fn can_afford(&self, estimated_cost: u64) -> bool {
        let (ledger, _) = self.lock_current();
        estimated_cost <= ledger.available(self.cap)
    }

    /// Place a hold of `amount` under `correlation_id`
    pub fn reserve(&self, correlation_id: &str, amount: u64) -> Result<(), BudgetError> {
        let (mut ledger, _) = self.lock_current();

        if ledger.reservations.contains_key(correlation_id) {
            METRICS.record_reservation("duplicate");
            return Err(BudgetError::DuplicateReservation(
                correlation_id.to_string(),
            ));
        }

        let available = ledger.available(self.cap);
        if amount > available {
            METRICS.record_reservation("insufficient");
            debug!(
                correlation_id,
                requested = amount,
                available,
                "Reservation refused"
            );
            return Err(BudgetError::InsufficientBudget {
                requested: amount,
                available,
            });
        }

        ledger
            .reservations
            .insert(correlation_id.to_string(), amount);
        METRICS.record_reservation("accepted");
        METRICS.set_available(ledger.available(self.cap));

        debug!(correlation_id, amount, "Reserved budget");
        Ok(())
    }

    /// Resolve a hold as spent, charging `actual_cost` rather than the held amount.
    ///
    /// An overrun is charged in full even when it takes `spent` past the cap.
    /// `available` then stays at 0 until the window resets.
    pub fn commit(&self, correlation_id: &str, actual_cost: u64) -> Result<(), BudgetError> {
        let (mut ledger, _) = self.lock_current();

        let held = ledger
            .reservations
            .remove(correlation_id)
            .ok_or_else(|| BudgetError::UnknownReservation(correlation_id.to_string()))?;

        ledger.spent = ledger.spent.saturating_add(actual_cost);

        if ledger.spent.saturating_add(ledger.reserved()) > self.cap {
            warn!(
                correlation_id,
                held,
                actual_cost,
                "Actual cost overran the cap"
            );
        }

        METRICS.record_commit(actual_cost);
        METRICS.set_available(ledger.available(self.cap));

        debug!(correlation_id, held, actual_cost, "Committed reservation");
        Ok(())
    }

    /// Drop a hold without spending. Returns the released amount, or `None` if
    /// there was nothing to release.
    pub fn release(&self, correlation_id: &str) -> Option<u64> {
        let (mut ledger, _) = self.lock_current();

        let released = ledger.reservations.remove(correlation_id);
        if let Some(amount) = released {
            METRICS.record_release();
            METRICS.set_available(ledger.available(self.cap));
            debug!(correlation_id, amount, "Released reservation");
        }

        released
    }

    /// Charge spend that has no reservation behind it, e.g. a paid call whose
    /// hold was wiped by a window reset while it ran
    pub fn record_unreserved(&self, actual_cost: u64) {
        let (mut ledger, _) = self.lock_current();
        ledger.spent = ledger.spent.saturating_add(actual_cost);
        METRICS.record_commit(actual_cost);
        METRICS.set_available(ledger.available(self.cap));
        warn!(actual_cost, "Recorded spend without a reservation");
    }

    /// Snapshot of the ledger after the lazy window check
    pub fn get_state(&self) -> BudgetState {
        let (ledger, window) = self.lock_current();
        let reserved = ledger.reserved();

        BudgetState {
            total: self.cap,
            spent: ledger.spent,
            reserved,
            available: ledger.available(self.cap),
            cap: self.cap,
            window_start: window.start(),
            window_end: window.end(),
        }
    }

    /// Outstanding reservations, sorted by correlation id
    pub fn outstanding(&self) -> Vec<Reservation> {
        let (ledger, _) = self.lock_current();
        let mut reservations: Vec<Reservation> = ledger
            .reservations
            .iter()
            .map(|(id, amount)| Reservation {
                correlation_id: id.clone(),
                amount: *amount,
            })
            .collect();
        reservations.sort_by(|a, b| a.correlation_id.cmp(&b.correlation_id));
        reservations
    }

    /// Amount held for `correlation_id`, if any
    pub fn reservation(&self, correlation_id: &str) -> Option<u64> {
        let (ledger, _) = self.lock_current();
        ledger.reservations.get(correlation_id).copied()
    }

    pub fn available(&self) -> u64 {
        self.get_state().available
    }

    pub fn spent(&self) -> u64 {
        self.get_state().spent
    }

    pub fn reserved(&self) -> u64 {
        self.get_state().reserved
    }

    pub fn cap(&self) -> u64 {
        self.cap
    }

    pub fn window(&self) -> &Arc<BudgetWindow> {
        &self.window
    }
}
