//! Money helpers
//!
//! All amounts are `rust_decimal::Decimal`. Rounding to a currency's minor unit
//! uses round-half-up (midpoint away from zero) everywhere in the engine.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::DomainError;

/// Minor-unit exponent used when a currency is not listed explicitly
pub const DEFAULT_MINOR_UNITS: u32 = 2;

/// Number of decimal places in the currency's minor unit (ISO 4217 exponent)
pub fn minor_units(currency: &str) -> u32 {
    match currency.to_ascii_uppercase().as_str() {
        "BIF" | "CLP" | "DJF" | "GNF" | "ISK" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "UGX"
        | "VND" | "VUV" | "XAF" | "XOF" | "XPF" => 0,
        "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
        _ => DEFAULT_MINOR_UNITS,
    }
}

/// Round an amount to the currency's minor-unit precision.
///
/// The result always carries exactly `minor_units(currency)` decimal places so
/// that `100` renders as `100.00` for USD.
pub fn round_money(amount: Decimal, currency: &str) -> Decimal {
    let places = minor_units(currency);
    let mut rounded = amount.round_dp_with_strategy(places, RoundingStrategy::MidpointAwayFromZero);
    rounded.rescale(places);
    rounded
}

/// Convert a decimal amount into integer minor units (e.g. cents)
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, DomainError> {
    let places = minor_units(currency);
    let factor = Decimal::from(10_i64.pow(places));
    (round_money(amount, currency) * factor)
        .to_i64()
        .ok_or_else(|| DomainError::Money(format!("{} {} overflows minor units", amount, currency)))
}

/// Convert integer minor units back into a decimal amount
pub fn from_minor_units(units: i64, currency: &str) -> Decimal {
    Decimal::new(units, minor_units(currency))
}

/// Validate and normalize an ISO 4217 currency code to upper case
pub fn normalize_currency(code: &str) -> Result<String, DomainError> {
    let trimmed = code.trim();
    if trimmed.len() == 3 && trimmed.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(trimmed.to_ascii_uppercase())
    } else {
        Err(DomainError::Parse {
            kind: "currency",
            value: code.to_string(),
        })
    }
}
