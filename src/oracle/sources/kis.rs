//! Korea Investment (KIS) open API client
//!
//! One authenticated session serves three instruments:
//! - domestic gold ETF (asking-price endpoint, current price + top of book)
//! - KRX gold spot (same payload shape, separate TR id)
//! - COMEX gold futures (overseas price endpoint)
//!
//! The OAuth access token is issued via `/oauth2/tokenP`, cached to disk and
//! renewed transparently when it expires or the venue rejects it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{KisConfig, KisCredentials};
use crate::oracle::sources::QuoteSource;
use crate::oracle::{FetchResult, Quote, Snapshot, SourceFailure};
use crate::types::SourceId;

const TOKEN_PATH: &str = "/oauth2/tokenP";
const DOMESTIC_ASKING_PRICE_PATH: &str =
    "/uapi/domestic-stock/v1/quotations/inquire-asking-price-exp-ccn";
const DOMESTIC_PRICE_PATH: &str = "/uapi/domestic-stock/v1/quotations/inquire-price";
const OVERSEAS_PRICE_PATH: &str = "/uapi/overseas-price/v1/quotations/price";

const TR_DOMESTIC_ASKING_PRICE: &str = "FHKST01010200";
const TR_GOLD_SPOT: &str = "KRD040200002";
const TR_OVERSEAS_PRICE: &str = "HHDFS76200200";

/// Cached OAuth token
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessToken {
    access_token: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && now < self.expires_at
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    grant_type: &'a str,
    appkey: &'a str,
    appsecret: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error_description: Option<String>,
}

/// Shared authenticated session against the KIS open API
pub struct KisSession {
    http: Client,
    base_url: String,
    credentials: KisCredentials,
    token_file: PathBuf,
    token_ttl: ChronoDuration,
    token: Mutex<Option<AccessToken>>,
}

impl KisSession {
    pub fn new(cfg: &KisConfig, credentials: KisCredentials) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .default_headers(headers)
            .build()
            .context("Failed to create KIS HTTP client")?;

        let token_file = PathBuf::from(&cfg.token_file);
        let cached = Self::load_token(&token_file);
        if let Some(token) = &cached {
            tracing::info!(expires_at = %token.expires_at, "Loaded cached KIS access token");
        }

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            credentials,
            token_file,
            token_ttl: ChronoDuration::hours(cfg.token_ttl_hours),
            token: Mutex::new(cached),
        })
    }

    fn load_token(path: &Path) -> Option<AccessToken> {
        let raw = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<AccessToken>(&raw) {
            Ok(token) => Some(token),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Ignoring unreadable token file");
                None
            }
        }
    }

    async fn save_token(&self, token: &AccessToken) {
        let json = match serde_json::to_string(token) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode KIS token");
                return;
            }
        };
        if let Some(parent) = self.token_file.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }
        if let Err(e) = tokio::fs::write(&self.token_file, json).await {
            tracing::warn!(path = %self.token_file.display(), error = %e, "Failed to cache KIS token");
        }
    }

    /// Current bearer token, renewing it first if needed
    async fn bearer(&self) -> Result<String, SourceFailure> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.is_valid_at(Utc::now()) {
                return Ok(token.access_token.clone());
            }
        }

        tracing::info!("KIS token missing or expired, issuing a new one");
        let token = self.issue_token().await?;
        self.save_token(&token).await;
        let bearer = token.access_token.clone();
        *guard = Some(token);
        Ok(bearer)
    }

    async fn issue_token(&self) -> Result<AccessToken, SourceFailure> {
        let url = format!("{}{}", self.base_url, TOKEN_PATH);
        let request = TokenRequest {
            grant_type: "client_credentials",
            appkey: &self.credentials.app_key,
            appsecret: &self.credentials.app_secret,
        };

        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SourceFailure::Auth(format!("token request failed: {}", e)))?;
        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| SourceFailure::Auth(format!("token response unreadable: {}", e)))?;

        match body.access_token {
            Some(access_token) if status.is_success() && !access_token.is_empty() => {
                let expires_at = Utc::now() + self.token_ttl;
                tracing::info!(expires_at = %expires_at, "✅ KIS access token issued");
                Ok(AccessToken {
                    access_token,
                    expires_at,
                })
            }
            _ => Err(SourceFailure::Auth(format!(
                "token issuance rejected ({}): {}",
                status,
                body.error_description.unwrap_or_default()
            ))),
        }
    }

    /// Drop the cached token so the next request renews it
    async fn invalidate(&self) {
        *self.token.lock().await = None;
    }

    /// Authenticated GET returning the JSON body once `rt_cd == "0"`
    async fn get_json(
        &self,
        path: &str,
        tr_id: &str,
        params: &[(&str, &str)],
    ) -> Result<Value, SourceFailure> {
        let bearer = self.bearer().await?;
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http
            .get(&url)
            .header("authorization", format!("Bearer {}", bearer))
            .header("appkey", &self.credentials.app_key)
            .header("appsecret", &self.credentials.app_secret)
            .header("tr_id", tr_id)
            .query(params)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let body: Value = match serde_json::from_str(&text) {
            Ok(body) => body,
            Err(_) if !status.is_success() => {
                return Err(SourceFailure::Http(format!("status {}", status)))
            }
            Err(e) => return Err(SourceFailure::Malformed(e.to_string())),
        };

        match check_rt_cd(&body) {
            RtCode::Ok if status.is_success() => Ok(body),
            RtCode::Ok => Err(SourceFailure::Http(format!("status {}", status))),
            RtCode::AuthRejected(msg) => {
                self.invalidate().await;
                Err(SourceFailure::Auth(msg))
            }
            RtCode::Rejected(msg) => Err(SourceFailure::Venue(msg)),
        }
    }
}

#[derive(Debug, PartialEq)]
enum RtCode {
    Ok,
    /// `rt_cd == "1"`: the venue answers this way when the token is stale
    AuthRejected(String),
    Rejected(String),
}

fn check_rt_cd(body: &Value) -> RtCode {
    let msg = || {
        format!(
            "{} {}",
            body["msg_cd"].as_str().unwrap_or_default(),
            body["msg1"].as_str().unwrap_or_default()
        )
        .trim()
        .to_string()
    };
    match body["rt_cd"].as_str() {
        Some("0") => RtCode::Ok,
        Some("1") => RtCode::AuthRejected(msg()),
        Some(code) => RtCode::Rejected(format!("rt_cd={} {}", code, msg())),
        None => RtCode::Rejected("missing rt_cd".to_string()),
    }
}

/// Lenient numeric field: accepts strings or numbers, anything else is 0 (unknown)
fn field_f64(obj: &Value, key: &str) -> f64 {
    match &obj[key] {
        Value::String(s) => s.trim().replace(',', "").parse::<f64>().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Domestic asking-price payload: book in `output1`, last price in `output2`
fn parse_domestic_quote(body: &Value) -> Result<Quote, SourceFailure> {
    let book = &body["output1"];
    let price = &body["output2"];
    if !book.is_object() && !price.is_object() {
        return Err(SourceFailure::Malformed(
            "missing output1/output2".to_string(),
        ));
    }

    Ok(Quote {
        current_price: field_f64(price, "stck_prpr"),
        bid_price: field_f64(book, "bidp1"),
        bid_size: field_f64(book, "bidp_rsqn1"),
        ask_price: field_f64(book, "askp1"),
        ask_size: field_f64(book, "askp_rsqn1"),
    })
}

/// Overseas price payload: everything in `output`
fn parse_overseas_quote(body: &Value) -> Result<Quote, SourceFailure> {
    let output = &body["output"];
    if !output.is_object() {
        return Err(SourceFailure::Malformed("missing output".to_string()));
    }

    Ok(Quote {
        current_price: field_f64(output, "last"),
        bid_price: field_f64(output, "bid"),
        bid_size: field_f64(output, "bid_size"),
        ask_price: field_f64(output, "ask"),
        ask_size: field_f64(output, "ask_size"),
    })
}

/// Instrument quoted through the KIS session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KisInstrument {
    DomesticEtf { symbol: String },
    GoldSpot { symbol: String },
    OverseasFutures { symbol: String, exchange: String },
}

impl KisInstrument {
    pub fn source_id(&self) -> SourceId {
        match self {
            KisInstrument::DomesticEtf { .. } => SourceId::Domestic,
            KisInstrument::GoldSpot { .. } => SourceId::GoldSpot,
            KisInstrument::OverseasFutures { .. } => SourceId::UsFutures,
        }
    }
}

/// One KIS instrument presented as an independent quote source
pub struct KisQuoteSource {
    session: std::sync::Arc<KisSession>,
    instrument: KisInstrument,
}

impl KisQuoteSource {
    pub fn new(session: std::sync::Arc<KisSession>, instrument: KisInstrument) -> Self {
        Self {
            session,
            instrument,
        }
    }

    async fn fetch_quote(&self) -> Result<Quote, SourceFailure> {
        match &self.instrument {
            KisInstrument::DomesticEtf { symbol } => {
                let body = self
                    .session
                    .get_json(
                        DOMESTIC_ASKING_PRICE_PATH,
                        TR_DOMESTIC_ASKING_PRICE,
                        &[("fid_cond_mrkt_div_code", "J"), ("fid_input_iscd", symbol.as_str())],
                    )
                    .await?;
                parse_domestic_quote(&body)
            }
            KisInstrument::GoldSpot { symbol } => {
                let body = self
                    .session
                    .get_json(
                        DOMESTIC_PRICE_PATH,
                        TR_GOLD_SPOT,
                        &[("fid_cond_mrkt_div_code", "J"), ("fid_input_iscd", symbol.as_str())],
                    )
                    .await?;
                parse_domestic_quote(&body)
            }
            KisInstrument::OverseasFutures { symbol, exchange } => {
                let body = self
                    .session
                    .get_json(
                        OVERSEAS_PRICE_PATH,
                        TR_OVERSEAS_PRICE,
                        &[("SYMB", symbol.as_str()), ("EXCD", exchange.as_str())],
                    )
                    .await?;
                parse_overseas_quote(&body)
            }
        }
    }
}

#[async_trait]
impl QuoteSource for KisQuoteSource {
    fn id(&self) -> SourceId {
        self.instrument.source_id()
    }

    fn name(&self) -> &'static str {
        "KoreaInvestment"
    }

    async fn fetch_snapshot(&self) -> FetchResult {
        let quote = self.fetch_quote().await?;
        let snapshot = Snapshot::from_quote(self.id(), quote, Utc::now())?;

        tracing::debug!(
            source = %self.id(),
            price = ?snapshot.current_price(),
            bid = ?snapshot.bid_price(),
            ask = ?snapshot.ask_price(),
            "KIS quote"
        );
        Ok(snapshot)
    }
}
