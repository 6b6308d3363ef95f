//! Money & P&L primitives (C3).
//!
//! All monetary values are `rust_decimal::Decimal`; floating point never
//! touches a persisted or reported dollar amount. Quantization rule per spec
//! §4.3: half-up ("round half away from zero") at persistence boundaries,
//! banker's rounding (round-half-to-even) for display.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_MULTIPLIER: Decimal = dec!(100);

/// Serde default for `PositionLeg::multiplier`.
pub fn default_multiplier() -> Decimal {
    DEFAULT_MULTIPLIER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceEffect {
    Credit,
    Debit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantityDirection {
    Short,
    Long,
}

/// Round to two decimal places, half-up. Used whenever a value is about to be
/// written to the store or sent to the broker.
pub fn quantize_persist(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to two decimal places, banker's rounding. Used for display-only
/// values (reports, logs).
pub fn quantize_display(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven)
}

/// Per-leg unrealised P&L (spec §4.3 formula 1).
///
/// Callers should prefer `mark_price` over `close_price` when both are
/// available; this function just takes whichever `current_price` the caller
/// already picked, but logs when it equals `avg_price` exactly, which is the
/// stale-quote signal spec.md calls out.
pub fn leg_unrealized_pnl(
    avg_price: Decimal,
    current_price: Decimal,
    quantity_abs: Decimal,
    direction: QuantityDirection,
    multiplier: Decimal,
) -> Decimal {
    if current_price == avg_price {
        warn!(
            avg_price = %avg_price,
            "current price equals average open price; possible stale mark/close data"
        );
    }
    let delta = match direction {
        QuantityDirection::Short => avg_price - current_price,
        QuantityDirection::Long => current_price - avg_price,
    };
    quantize_persist(delta * quantity_abs * multiplier)
}

/// Profit-target limit price (spec §4.3 formula 2).
pub fn profit_target_price(entry_price: Decimal, target_pct: Decimal, effect: PriceEffect) -> Decimal {
    let fraction = target_pct / dec!(100);
    let price = match effect {
        PriceEffect::Credit => entry_price * (Decimal::ONE - fraction),
        PriceEffect::Debit => entry_price * (Decimal::ONE + fraction),
    };
    quantize_persist(price)
}

/// A minimal view of a transaction sufficient to compute realised P&L,
/// satisfying spec §4.3 formula 3. `action` is the broker action string
/// (`"Sell to Open"`, `"Buy to Close"`, etc.); assignment/exercise
/// transactions are included among `closings` by the caller.
#[derive(Debug, Clone)]
pub struct PnlTransaction {
    pub action: String,
    pub net_value: Decimal,
}

/// Realised position P&L from opening + closing (incl. assignment/exercise)
/// transactions. No commissions or fees are subtracted here — those are
/// tracked separately on `Trade`/`Transaction` records.
pub fn realized_position_pnl(openings: &[PnlTransaction], closings: &[PnlTransaction]) -> Decimal {
    let opening_value: Decimal = openings
        .iter()
        .map(|t| {
            if t.action.eq_ignore_ascii_case("Sell to Open") {
                t.net_value
            } else {
                -t.net_value.abs()
            }
        })
        .sum();

    let closing_value: Decimal = closings
        .iter()
        .map(|t| {
            if t.action.eq_ignore_ascii_case("Buy to Close") {
                -t.net_value.abs()
            } else {
                t.net_value
            }
        })
        .sum();

    quantize_persist(opening_value + closing_value)
}

/// Profit-target realised P&L on a single spread fill: `(original_credit -
/// |fill_price|) * 100` per contract (spec §4.10 step 6 / §4.11 step 4).
/// `contract_multiplier` defaults to 100 but is a parameter since some
/// instruments differ.
pub fn profit_target_realized_pnl(
    original_credit: Decimal,
    fill_price: Decimal,
    contract_multiplier: Decimal,
) -> Decimal {
    quantize_persist((original_credit - fill_price.abs()) * contract_multiplier)
}
