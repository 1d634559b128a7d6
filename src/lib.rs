//! GoldNav Library
//!
//! Gold ETF quote collector: polls KIS and Yahoo Finance every second,
//! derives the theoretical NAV and records an append-only CSV time series.

pub mod collector;
pub mod config;
pub mod oracle;
pub mod persistence;
pub mod types;
pub mod valuation;

#[cfg(feature = "dashboard")]
pub mod dashboard;
