use crate::money::{Amount, AMOUNT_SCALE};

/// `base * percentage / 100` on fixed-point values, truncated toward zero.
///
/// `percentage` uses the same scale as amounts (10% == `10 * AMOUNT_SCALE`).
/// The product is formed in i128; a result that does not fit an `Amount`
/// saturates.
#[inline]
pub fn commission_amount(base: Amount, percentage: Amount) -> Amount {
    let raw = base as i128 * percentage as i128 / (100 * AMOUNT_SCALE as i128);
    raw.clamp(Amount::MIN as i128, Amount::MAX as i128) as Amount
}
