//! Core types used throughout GoldNav
//!
//! Source identities and clock helpers shared by the collector, the sources
//! and the store.

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one configured market-data source.
///
/// The set is fixed: every source owns one column group in the persisted
/// record, whether or not it is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceId {
    /// Domestic gold ETF (KRX 411060) via Korea Investment
    Domestic,
    /// COMEX gold futures via Korea Investment overseas quotations
    UsFutures,
    /// KRX gold spot (04020000) via Korea Investment
    GoldSpot,
    /// USD/KRW exchange rate via Yahoo Finance
    UsdKrw,
}

impl SourceId {
    pub const ALL: [SourceId; 4] = [
        SourceId::Domestic,
        SourceId::UsFutures,
        SourceId::GoldSpot,
        SourceId::UsdKrw,
    ];

    /// Stable key used in config, logs and CSV column prefixes
    pub fn key(&self) -> &'static str {
        match self {
            SourceId::Domestic => "domestic",
            SourceId::UsFutures => "us_futures",
            SourceId::GoldSpot => "gold_spot",
            SourceId::UsdKrw => "usd_krw",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "domestic" | "etf" => Some(SourceId::Domestic),
            "us_futures" | "futures" => Some(SourceId::UsFutures),
            "gold_spot" | "spot" => Some(SourceId::GoldSpot),
            "usd_krw" | "fx" => Some(SourceId::UsdKrw),
            _ => None,
        }
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Build a fixed offset from whole hours, falling back to UTC when out of range.
pub fn offset_from_hours(hours: i32) -> FixedOffset {
    FixedOffset::east_opt(hours.saturating_mul(3600)).unwrap_or_else(|| {
        tracing::warn!(hours, "utc offset out of range, using UTC");
        FixedOffset::east_opt(0).unwrap_or(Utc.fix())
    })
}

/// Current wall-clock time in the configured offset
pub fn local_now(offset: FixedOffset) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&offset)
}
