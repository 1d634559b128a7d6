//! NAV valuation
//!
//! Theoretical NAV of the gold ETF derived from the gold spot price:
//!
//! `nav = spot_price × gold_holding_per_unit / total_units`
//!
//! With the default constants (14,000 g per creation unit, 100,000 units)
//! the multiplier is exactly 0.14. Pure computation, no I/O.

use anyhow::{bail, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::oracle::Snapshot;
use crate::types::SourceId;

/// Decimal places of the NAV in the money unit
pub const NAV_DECIMALS: u32 = 2;

/// Whether the NAV could be computed this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavStatus {
    Ok,
    Unavailable,
}

impl NavStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NavStatus::Ok => "ok",
            NavStatus::Unavailable => "unavailable",
        }
    }
}

impl fmt::Display for NavStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one NAV computation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DerivedMetric {
    /// NAV per unit, `0.0` when unavailable
    pub value: f64,
    pub status: NavStatus,
    /// Reference price the value was computed from
    pub reference_price: Option<f64>,
    /// Current prices of the other sources at computation time (audit only)
    pub source_prices: BTreeMap<SourceId, f64>,
}

impl DerivedMetric {
    fn unavailable(source_prices: BTreeMap<SourceId, f64>) -> Self {
        Self {
            value: 0.0,
            status: NavStatus::Unavailable,
            reference_price: None,
            source_prices,
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == NavStatus::Ok
    }
}

/// NAV calculator holding the fixed fund constants
#[derive(Debug, Clone)]
pub struct NavCalculator {
    gold_holding_per_unit: u64,
    total_units: u64,
    multiplier: Decimal,
}

impl NavCalculator {
    pub fn new(gold_holding_per_unit: u64, total_units: u64) -> Result<Self> {
        if total_units == 0 {
            bail!("valuation.total_units must be greater than zero");
        }
        if gold_holding_per_unit == 0 {
            bail!("valuation.gold_holding_per_unit must be greater than zero");
        }

        let multiplier = Decimal::from(gold_holding_per_unit) / Decimal::from(total_units);

        tracing::info!(
            gold_holding_per_unit,
            total_units,
            multiplier = %multiplier,
            "📊 NAV calculator initialized"
        );

        Ok(Self {
            gold_holding_per_unit,
            total_units,
            multiplier,
        })
    }

    pub fn multiplier(&self) -> Decimal {
        self.multiplier
    }

    pub fn gold_holding_per_unit(&self) -> u64 {
        self.gold_holding_per_unit
    }

    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    /// NAV from a spot price.
    ///
    /// `None` if the price is missing, non-positive, or the product overflows.
    pub fn nav_for_price(&self, spot_price: f64) -> Option<f64> {
        if !(spot_price.is_finite() && spot_price > 0.0) {
            return None;
        }
        let price = Decimal::from_f64(spot_price)?;
        price
            .checked_mul(self.multiplier)?
            .round_dp_with_strategy(NAV_DECIMALS, RoundingStrategy::MidpointAwayFromZero)
            .to_f64()
    }

    /// Compute the NAV from the reference snapshot.
    ///
    /// `others` never feed the formula; their current prices are copied into
    /// the result for display.
    pub fn compute(&self, reference: Option<&Snapshot>, others: &[&Snapshot]) -> DerivedMetric {
        let source_prices: BTreeMap<SourceId, f64> = others
            .iter()
            .filter_map(|s| s.current_price().map(|p| (s.source(), p)))
            .collect();

        let Some(reference_price) = reference.and_then(|s| s.current_price()) else {
            return DerivedMetric::unavailable(source_prices);
        };

        match self.nav_for_price(reference_price) {
            Some(value) => DerivedMetric {
                value,
                status: NavStatus::Ok,
                reference_price: Some(reference_price),
                source_prices,
            },
            None => DerivedMetric::unavailable(source_prices),
        }
    }
}

impl Default for NavCalculator {
    fn default() -> Self {
        Self {
            gold_holding_per_unit: 14_000,
            total_units: 100_000,
            multiplier: Decimal::new(14, 2),
        }
    }
}
