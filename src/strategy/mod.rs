//! Valuation engine.
//!
//! `Valuator::evaluate` turns a listing and its collection stats into a
//! `Decision`. It is pure: no I/O, no clock reads, no shared state. Rules,
//! in order:
//!
//! 1. No floor for the model, or a non-positive price → `missing-fields`.
//! 2. Floor data of unknown age, or older than `max_floor_age` at the time
//!    the listing was observed → `stale-floor-data`.
//! 3. `raw = floor - ask - floor * fee_rate`; a positive `raw` is scaled by
//!    the liquidity multiplier.
//! 4. Accept iff the adjusted profit is at least `min_profit`.
//!
//! Numbers too large to compute with are treated like missing fields.

pub mod liquidity;

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use crate::types::{Decision, Listing, MarketStats, RejectReason, Verdict};
use liquidity::LiquidityWeighting;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ValuationConfig {
    /// Minimum adjusted profit to accept.
    pub min_profit: Decimal,
    pub max_floor_age: Duration,
    pub liquidity: LiquidityWeighting,
}

impl Default for ValuationConfig {
    fn default() -> Self {
        Self {
            min_profit: dec!(0.3),
            max_floor_age: Duration::seconds(120),
            liquidity: LiquidityWeighting::Flat,
        }
    }
}

/// Resale fee charged on selling at the floor. `None` on overflow.
pub fn estimated_fees(floor: Decimal, fee_rate: Decimal) -> Option<Decimal> {
    floor.checked_mul(fee_rate)
}

// ---------------------------------------------------------------------------
// Valuator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Valuator {
    config: ValuationConfig,
}

impl Valuator {
    pub fn new(config: ValuationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValuationConfig {
        &self.config
    }

    pub fn evaluate(&self, listing: Arc<Listing>, stats: &MarketStats) -> Decision {
        let floor = match listing.floor_price {
            Some(floor) if floor > Decimal::ZERO && listing.price > Decimal::ZERO => floor,
            _ => return rejected(listing, RejectReason::MissingFields),
        };

        let fresh = stats
            .floor_observed_at
            .map(|at| listing.observed_at - at <= self.config.max_floor_age)
            .unwrap_or(false);
        if !fresh {
            return rejected(listing, RejectReason::StaleFloorData);
        }

        let multiplier = self
            .config
            .liquidity
            .multiplier(listing.velocity, listing.trending);
        let Some((raw_profit, profit)) =
            weighted_profit(floor, listing.price, stats.fee_rate, multiplier)
        else {
            return rejected(listing, RejectReason::MissingFields);
        };

        let verdict = if profit >= self.config.min_profit {
            Verdict::Accept
        } else {
            Verdict::Reject(RejectReason::BelowThreshold)
        };

        Decision {
            listing,
            raw_profit,
            profit,
            multiplier,
            verdict,
        }
    }
}

/// `(raw, adjusted)` profit, or `None` when the arithmetic overflows.
fn weighted_profit(
    floor: Decimal,
    ask: Decimal,
    fee_rate: Decimal,
    multiplier: Decimal,
) -> Option<(Decimal, Decimal)> {
    let raw = floor
        .checked_sub(ask)?
        .checked_sub(estimated_fees(floor, fee_rate)?)?;
    let adjusted = if raw > Decimal::ZERO {
        raw.checked_mul(multiplier)?
    } else {
        raw
    };
    Some((raw, adjusted))
}

fn rejected(listing: Arc<Listing>, reason: RejectReason) -> Decision {
    Decision {
        listing,
        raw_profit: Decimal::ZERO,
        profit: Decimal::ZERO,
        multiplier: Decimal::ONE,
        verdict: Verdict::Reject(reason),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
