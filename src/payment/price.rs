//! Price strings accepted by payment requests
//!
//! Two forms are understood:
//! - an integer lamport amount, optionally suffixed with `lamports`/`lamport`
//! - a USD amount, optionally prefixed with `$`, converted at a SOL/USD rate

use thiserror::Error;

pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PriceError {
    #[error("Price is empty")]
    Empty,

    #[error("Price must be positive: {0}")]
    NonPositive(String),

    #[error("Unparseable price: {0}")]
    Unparseable(String),

    #[error("Invalid SOL price: {0}")]
    InvalidSolPrice(f64),
}

/// Parse a price string into lamports.
///
/// `sol_price_usd` is only consulted for USD prices.
pub fn parse_price(price: &str, sol_price_usd: f64) -> Result<u64, PriceError> {
    let trimmed = price.trim();
    if trimmed.is_empty() {
        return Err(PriceError::Empty);
    }

    if let Some(amount) = strip_lamport_suffix(trimmed) {
        return parse_lamports(amount.trim(), price);
    }

    if trimmed.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b'+') {
        return parse_lamports(trimmed, price);
    }

    let usd_text = trimmed.strip_prefix('$').unwrap_or(trimmed).trim();
    let usd: f64 = usd_text
        .parse()
        .map_err(|_| PriceError::Unparseable(price.to_string()))?;
    usd_to_lamports(usd, sol_price_usd).map_err(|e| match e {
        PriceError::NonPositive(_) => PriceError::NonPositive(price.to_string()),
        PriceError::Unparseable(_) => PriceError::Unparseable(price.to_string()),
        other => other,
    })
}

/// Convert a USD amount into lamports, rounding down
pub fn usd_to_lamports(usd: f64, sol_price_usd: f64) -> Result<u64, PriceError> {
    if !sol_price_usd.is_finite() || sol_price_usd <= 0.0 {
        return Err(PriceError::InvalidSolPrice(sol_price_usd));
    }
    if !usd.is_finite() {
        return Err(PriceError::Unparseable(usd.to_string()));
    }
    if usd <= 0.0 {
        return Err(PriceError::NonPositive(usd.to_string()));
    }

    let lamports = (usd / sol_price_usd * LAMPORTS_PER_SOL as f64).floor();
    if lamports < 1.0 {
        return Err(PriceError::NonPositive(usd.to_string()));
    }
    if lamports >= u64::MAX as f64 {
        return Err(PriceError::Unparseable(usd.to_string()));
    }

    Ok(lamports as u64)
}

fn strip_lamport_suffix(price: &str) -> Option<&str> {
    let lower = price.to_ascii_lowercase();
    ["lamports", "lamport"]
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map(|suffix| &price[..price.len() - suffix.len()])
}

fn parse_lamports(amount: &str, original: &str) -> Result<u64, PriceError> {
    let value: i128 = amount
        .parse()
        .map_err(|_| PriceError::Unparseable(original.to_string()))?;

    if value <= 0 {
        return Err(PriceError::NonPositive(original.to_string()));
    }

    u64::try_from(value).map_err(|_| PriceError::Unparseable(original.to_string()))
}
