//! Liquidity weighting.
//!
//! Scales a positive profit estimate by how easily the item will resell.
//! Faster-selling models and trending collections get a higher multiplier;
//! the curve is monotonic non-decreasing in both inputs as long as
//! `low_velocity_multiplier <= min_multiplier`. A model that sells fewer
//! than `min_velocity` times a day is discounted flat.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Parameters of the linear curve.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearCurve {
    /// Sales per 24h at which the multiplier is exactly 1 (before the
    /// trending bonus).
    pub velocity_pivot: Decimal,
    /// Multiplier change per sale above or below the pivot.
    pub per_sale: Decimal,
    pub trending_bonus: Decimal,
    pub min_multiplier: Decimal,
    pub max_multiplier: Decimal,
    /// Sales per 24h below which the model counts as illiquid.
    pub min_velocity: Option<Decimal>,
    /// Multiplier for illiquid models. Not clamped by `min_multiplier`.
    pub low_velocity_multiplier: Decimal,
}

impl Default for LinearCurve {
    fn default() -> Self {
        Self {
            velocity_pivot: dec!(3),
            per_sale: dec!(0.02),
            trending_bonus: dec!(0.10),
            min_multiplier: dec!(1.0),
            max_multiplier: dec!(1.5),
            min_velocity: None,
            low_velocity_multiplier: dec!(0.5),
        }
    }
}

impl LinearCurve {
    pub fn multiplier(&self, velocity: Decimal, trending: bool) -> Decimal {
        if let Some(min_velocity) = self.min_velocity {
            if velocity < min_velocity {
                return self.low_velocity_multiplier;
            }
        }

        let bonus = if trending {
            self.trending_bonus
        } else {
            Decimal::ZERO
        };
        let m = velocity
            .checked_sub(self.velocity_pivot)
            .and_then(|d| d.checked_mul(self.per_sale))
            .and_then(|slope| Decimal::ONE.checked_add(slope))
            .and_then(|m| m.checked_add(bonus));
        match m {
            Some(m) => m.max(self.min_multiplier).min(self.max_multiplier),
            // Out of range: the side of the pivot picks the bound.
            None if velocity > self.velocity_pivot => self.max_multiplier,
            None => self.min_multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum LiquidityWeighting {
    /// Every listing weighs 1.
    #[default]
    Flat,
    Linear(LinearCurve),
}

impl LiquidityWeighting {
    pub fn multiplier(&self, velocity: Decimal, trending: bool) -> Decimal {
        match self {
            LiquidityWeighting::Flat => Decimal::ONE,
            LiquidityWeighting::Linear(curve) => curve.multiplier(velocity, trending),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LiquidityWeighting::Flat => "flat",
            LiquidityWeighting::Linear(_) => "linear",
        }
    }
}
