//! Oracle module - Multi-source quote acquisition
//!
//! Polls the Korea Investment and Yahoo Finance endpoints once per cycle and
//! reconciles whatever comes back into a single cycle aggregate.

mod aggregator;
pub mod sources;

pub use aggregator::CycleAggregate;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::types::SourceId;

/// Outcome of one fetch: a validated snapshot or the reason there is none.
pub type FetchResult = Result<Snapshot, SourceFailure>;

/// Why a source produced no usable snapshot this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceFailure {
    #[error("request timed out")]
    Timeout,
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("venue rejected request: {0}")]
    Venue(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("no positive price in quote")]
    NoPrice,
    #[error("fetch task aborted: {0}")]
    Aborted(String),
}

impl SourceFailure {
    /// Short reason tag for structured logs
    pub fn reason(&self) -> &'static str {
        match self {
            SourceFailure::Timeout => "timeout",
            SourceFailure::Auth(_) => "auth",
            SourceFailure::Http(_) => "http",
            SourceFailure::Venue(_) => "venue",
            SourceFailure::Malformed(_) => "malformed",
            SourceFailure::NoPrice => "no_price",
            SourceFailure::Aborted(_) => "aborted",
        }
    }
}

impl From<reqwest::Error> for SourceFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceFailure::Timeout
        } else if e.is_decode() {
            SourceFailure::Malformed(e.to_string())
        } else {
            SourceFailure::Http(e.to_string())
        }
    }
}

/// Raw top-of-book reading as parsed from a venue payload.
///
/// Zero means "not reported". Nothing here is validated yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Quote {
    pub current_price: f64,
    pub bid_price: f64,
    pub bid_size: f64,
    pub ask_price: f64,
    pub ask_size: f64,
}

impl Quote {
    /// Quote that only carries a last price (FX rates)
    pub fn price_only(current_price: f64) -> Self {
        Self {
            current_price,
            ..Self::default()
        }
    }
}

/// One source's validated reading for one cycle.
///
/// Only constructible through [`Snapshot::from_quote`], so holding one means
/// at least one of the three price fields is strictly positive. Non-positive
/// or non-finite values are normalized to `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    source: SourceId,
    current_price: Option<f64>,
    bid_price: Option<f64>,
    bid_size: Option<f64>,
    ask_price: Option<f64>,
    ask_size: Option<f64>,
    observed_at: DateTime<Utc>,
}

fn known(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

impl Snapshot {
    pub fn from_quote(
        source: SourceId,
        quote: Quote,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, SourceFailure> {
        let snapshot = Self {
            source,
            current_price: known(quote.current_price),
            bid_price: known(quote.bid_price),
            bid_size: known(quote.bid_size),
            ask_price: known(quote.ask_price),
            ask_size: known(quote.ask_size),
            observed_at,
        };

        if snapshot.current_price.is_none()
            && snapshot.bid_price.is_none()
            && snapshot.ask_price.is_none()
        {
            return Err(SourceFailure::NoPrice);
        }
        Ok(snapshot)
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    pub fn current_price(&self) -> Option<f64> {
        self.current_price
    }

    pub fn bid_price(&self) -> Option<f64> {
        self.bid_price
    }

    pub fn bid_size(&self) -> Option<f64> {
        self.bid_size
    }

    pub fn ask_price(&self) -> Option<f64> {
        self.ask_price
    }

    pub fn ask_size(&self) -> Option<f64> {
        self.ask_size
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }

    /// Positive last price but an empty side of the book.
    ///
    /// Still a valid snapshot; only surfaced in logs.
    pub fn degraded_quote(&self) -> bool {
        self.current_price.is_some() && (self.bid_price.is_none() || self.ask_price.is_none())
    }
}
