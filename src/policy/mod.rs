//! Payment policy enforcement
//!
//! Decides whether an agent may pay a vendor at all:
//! - Vendor allow-listing
//! - Per-vendor request limits per window
//! - A policy-level spend cap over settled payments

pub mod engine;
pub mod models;

pub use engine::PolicyEngine;
pub use models::{
    BudgetStatus, HaltConditions, PaymentPolicy, PolicyViolation, Provenance, SpendRecord,
};
