//! Spend budget with reservation semantics
//!
//! The ledger holds lamports against a capped budget that resets each policy
//! window. Actions reserve before they run and commit or release afterwards.

pub mod clock;
pub mod ledger;
pub mod models;

pub use clock::{BudgetWindow, Clock, ManualClock, SystemClock, WindowSnapshot};
pub use ledger::{BudgetError, BudgetManager};
pub use models::{BudgetState, Reservation};
