//! Risk-based position sizing.
//!
//! ```text
//! per_share_risk = max(|entry - stop|, entry * 1%)
//! commission     = max(round(balance / entry * 0.005), 1)
//! tolerated_risk = |risk_pct / 100 * balance - commission|
//! quantity       = max(round(min(tolerated_risk / per_share_risk,
//!                                floor(balance * 0.95 / entry))), 1)
//! take_profit    = entry +/- per_share_risk * reward_risk
//! ```

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use super::error::SizingError;
use super::types::{SizingInput, SizingResult};
use crate::domain::Action;

/// Smallest per-share risk, as a fraction of entry.
pub const MIN_RISK_FRACTION: Decimal = dec!(0.01);

/// Commission estimate per share.
pub const COMMISSION_PER_SHARE: Decimal = dec!(0.005);

/// Commission floor.
pub const MIN_COMMISSION: Decimal = dec!(1);

/// Fraction of the balance a single position may consume.
pub const BUYING_POWER_FRACTION: Decimal = dec!(0.95);

fn validate_input(input: &SizingInput) -> Result<(), SizingError> {
    if input.entry_price <= Decimal::ZERO {
        return Err(SizingError::InvalidInput(format!(
            "entry price must be positive, got {}",
            input.entry_price
        )));
    }
    if input.account_balance <= Decimal::ZERO {
        return Err(SizingError::InvalidInput(format!(
            "account balance must be positive, got {}",
            input.account_balance
        )));
    }
    if input.stop_price < Decimal::ZERO {
        return Err(SizingError::InvalidInput(format!(
            "stop price must not be negative, got {}",
            input.stop_price
        )));
    }
    if input.risk_pct <= Decimal::ZERO {
        return Err(SizingError::InvalidInput(
            "risk percent must be positive".to_string(),
        ));
    }
    if input.reward_risk <= Decimal::ZERO {
        return Err(SizingError::InvalidInput(
            "reward:risk ratio must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Take-profit price for `entry` at `per_share_risk * ratio`, rounded to cents.
#[must_use]
pub fn take_profit_price(
    entry: Decimal,
    per_share_risk: Decimal,
    ratio: Decimal,
    action: Action,
) -> Decimal {
    let distance = per_share_risk * ratio;
    let target = match action {
        Action::Buy => entry + distance,
        Action::Sell => entry - distance,
    };
    target.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Size a position from account risk.
///
/// # Errors
///
/// `InvalidInput` when entry price or account balance is not positive, or
/// the risk parameters are not positive.
pub fn size(input: &SizingInput) -> Result<SizingResult, SizingError> {
    validate_input(input)?;
    let entry = input.entry_price;
    let balance = input.account_balance;

    let per_share_risk = (entry - input.stop_price)
        .abs()
        .max(entry * MIN_RISK_FRACTION);

    let commission = (balance / entry * COMMISSION_PER_SHARE)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .max(MIN_COMMISSION);

    let tolerated_risk = (input.risk_pct / dec!(100) * balance - commission).abs();

    let by_risk = tolerated_risk / per_share_risk;
    let by_buying_power = (balance * BUYING_POWER_FRACTION / entry).floor();
    let quantity = by_risk
        .min(by_buying_power)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven)
        .max(Decimal::ONE);

    Ok(SizingResult {
        quantity,
        take_profit: take_profit_price(entry, per_share_risk, input.reward_risk, input.action),
        commission,
        per_share_risk,
        tolerated_risk,
    })
}
