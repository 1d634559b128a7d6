//! Quote source implementations (Korea Investment, Yahoo Finance)

mod kis;
mod yahoo;

pub use kis::{KisInstrument, KisQuoteSource, KisSession};
pub use yahoo::YahooFxSource;

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::oracle::FetchResult;
use crate::types::SourceId;

/// Trait for quote source clients
///
/// Ordinary "no data this cycle" conditions come back as `Err(SourceFailure)`;
/// implementations must not panic on them.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Column group this source fills
    fn id(&self) -> SourceId;

    /// Human-readable venue name for logs
    fn name(&self) -> &'static str;

    /// Fetch one snapshot
    async fn fetch_snapshot(&self) -> FetchResult;
}

/// Build every enabled source from config.
///
/// Missing KIS credentials are fatal when any KIS-backed source is on.
pub fn build_sources(cfg: &AppConfig) -> Result<Vec<Arc<dyn QuoteSource>>> {
    let mut sources: Vec<Arc<dyn QuoteSource>> = Vec::new();

    if cfg.needs_kis() {
        let credentials = cfg
            .kis_credentials()
            .context("APP_KEY and APP_SECRET must be set to use Korea Investment sources")?;
        let session = Arc::new(KisSession::new(&cfg.sources.kis, credentials)?);
        let kis = &cfg.sources.kis;

        if cfg.sources.domestic_enabled {
            sources.push(Arc::new(KisQuoteSource::new(
                session.clone(),
                KisInstrument::DomesticEtf {
                    symbol: kis.etf_symbol.clone(),
                },
            )));
        }
        if cfg.sources.us_futures_enabled {
            sources.push(Arc::new(KisQuoteSource::new(
                session.clone(),
                KisInstrument::OverseasFutures {
                    symbol: kis.futures_symbol.clone(),
                    exchange: kis.futures_exchange.clone(),
                },
            )));
        }
        if cfg.sources.gold_spot_enabled {
            sources.push(Arc::new(KisQuoteSource::new(
                session,
                KisInstrument::GoldSpot {
                    symbol: kis.gold_spot_symbol.clone(),
                },
            )));
        }
    }

    if cfg.sources.usd_krw_enabled {
        sources.push(Arc::new(YahooFxSource::new(&cfg.sources.yahoo)?));
    }

    tracing::info!(
        sources = ?sources.iter().map(|s| s.id().key()).collect::<Vec<_>>(),
        "Quote sources configured"
    );

    Ok(sources)
}
