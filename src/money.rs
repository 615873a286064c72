//! Fixed-Point Money
//!
//! Every balance, payout and percentage in the engine is an `Amount`: a
//! signed integer count of 10^-8 units. Commission arithmetic never touches
//! binary floating point, so thirty levels of small payouts cannot drift.

use anyhow::{anyhow, bail, Result};

/// Fixed-point amount with 8 decimal places.
pub type Amount = i64;

/// Conversion factor: 1.0 = 100_000_000 units
pub const AMOUNT_SCALE: i64 = 100_000_000;

const SCALE_DIGITS: usize = 8;

/// Convert f64 to fixed-point Amount.
///
/// Only used at the edges (numeric TOML values); the engine itself never
/// produces floats.
#[inline]
pub fn to_amount(value: f64) -> Amount {
    (value * AMOUNT_SCALE as f64).round() as Amount
}

/// Parse a decimal string such as `"1000"`, `"12.5"` or `"-0.00000001"`
/// exactly into an `Amount`.
pub fn parse_amount(input: &str) -> Result<Amount> {
    let s = input.trim();
    if s.is_empty() {
        bail!("empty amount");
    }

    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    let (whole, frac) = match digits.split_once('.') {
        Some((w, f)) => (w, f),
        None => (digits, ""),
    };

    if whole.is_empty() && frac.is_empty() {
        bail!("invalid amount: {input}");
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        bail!("invalid amount: {input}");
    }
    if frac.len() > SCALE_DIGITS {
        bail!("amount {input} has more than {SCALE_DIGITS} decimal places");
    }

    let whole_units: i64 = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<i64>()
            .map_err(|_| anyhow!("amount out of range: {input}"))?
    };

    let mut frac_padded = frac.to_string();
    while frac_padded.len() < SCALE_DIGITS {
        frac_padded.push('0');
    }
    let frac_units: i64 = frac_padded.parse().unwrap_or(0);

    let units = whole_units
        .checked_mul(AMOUNT_SCALE)
        .and_then(|w| w.checked_add(frac_units))
        .ok_or_else(|| anyhow!("amount out of range: {input}"))?;

    Ok(if negative { -units } else { units })
}

/// Render an `Amount` as a decimal string with at least two decimals.
pub fn format_amount(amount: Amount) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = (amount as i128).abs();
    let scale = AMOUNT_SCALE as i128;
    let whole = abs / scale;
    let frac = format!("{:08}", abs % scale);
    let trimmed = frac.trim_end_matches('0');
    let frac = if trimmed.len() < 2 {
        &frac[..2]
    } else {
        trimmed
    };
    format!("{sign}{whole}.{frac}")
}

/// Serde helpers that carry amounts as decimal strings on the wire.
pub mod serde_decimal {
    use super::{format_amount, parse_amount, Amount};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_amount(*amount))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_amount(&raw).map_err(de::Error::custom)
    }
}
