//! Yahoo Finance chart API client for the USD/KRW rate

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{
    header::{HeaderMap, HeaderValue, USER_AGENT},
    Client,
};
use serde::Deserialize;
use std::time::Duration;

use crate::config::YahooConfig;
use crate::oracle::sources::QuoteSource;
use crate::oracle::{FetchResult, Quote, Snapshot, SourceFailure};
use crate::types::SourceId;

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: ChartMeta,
}

#[derive(Debug, Deserialize)]
struct ChartMeta {
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
}

fn parse_chart(body: &str) -> Result<Quote, SourceFailure> {
    let response: ChartResponse =
        serde_json::from_str(body).map_err(|e| SourceFailure::Malformed(e.to_string()))?;

    if let Some(error) = response.chart.error.filter(|e| !e.is_null()) {
        return Err(SourceFailure::Venue(error.to_string()));
    }

    let price = response
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .and_then(|result| result.meta.regular_market_price)
        .ok_or_else(|| SourceFailure::Malformed("missing regularMarketPrice".to_string()))?;

    Ok(Quote::price_only(price))
}

#[derive(Debug, Clone)]
pub struct YahooFxSource {
    http: Client,
    url: String,
}

impl YahooFxSource {
    pub fn new(cfg: &YahooConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));

        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .default_headers(headers)
            .build()
            .context("Failed to create Yahoo HTTP client")?;

        Ok(Self {
            http,
            url: format!("{}/{}", cfg.base_url.trim_end_matches('/'), cfg.symbol),
        })
    }
}

#[async_trait]
impl QuoteSource for YahooFxSource {
    fn id(&self) -> SourceId {
        SourceId::UsdKrw
    }

    fn name(&self) -> &'static str {
        "YahooFinance"
    }

    async fn fetch_snapshot(&self) -> FetchResult {
        let response = self
            .http
            .get(&self.url)
            .query(&[("interval", "1m"), ("range", "1d")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SourceFailure::Http(format!("status {}", status)));
        }

        let body = response.text().await?;
        let quote = parse_chart(&body)?;
        Snapshot::from_quote(SourceId::UsdKrw, quote, Utc::now())
    }
}
