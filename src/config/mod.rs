//! Configuration management for GoldNav
//!
//! Loads from config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::types::SourceId;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub collector: CollectorConfig,
    pub sources: SourcesConfig,
    pub valuation: ValuationConfig,
    pub persistence: PersistenceConfig,
    pub dashboard: DashboardConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Target cycle period in milliseconds
    pub period_ms: u64,
    /// Deadline for all fetches of one cycle in milliseconds
    pub fetch_deadline_ms: u64,
    /// Offset applied to cycle timestamps (9 = KST)
    pub utc_offset_hours: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    /// Enable the domestic gold ETF quote
    pub domestic_enabled: bool,
    /// Enable the COMEX gold futures quote
    pub us_futures_enabled: bool,
    /// Enable the KRX gold spot quote (NAV reference)
    pub gold_spot_enabled: bool,
    /// Enable the USD/KRW rate
    pub usd_krw_enabled: bool,
    pub kis: KisConfig,
    pub yahoo: YahooConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KisConfig {
    /// Korea Investment open API endpoint
    pub base_url: String,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Where the access token is cached between runs
    pub token_file: String,
    /// Token lifetime assumed after issuance, in hours
    pub token_ttl_hours: i64,
    /// Domestic gold ETF code
    pub etf_symbol: String,
    /// KRX gold spot code
    pub gold_spot_symbol: String,
    /// Overseas futures symbol
    pub futures_symbol: String,
    /// Overseas futures exchange code
    pub futures_exchange: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct YahooConfig {
    pub base_url: String,
    pub symbol: String,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValuationConfig {
    /// Source whose current price feeds the NAV
    pub reference_source: String,
    /// Grams of gold held per creation unit
    pub gold_holding_per_unit: u64,
    /// Total units outstanding
    pub total_units: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory
    pub data_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DashboardConfig {
    /// Serve the read API (requires the `dashboard` feature)
    pub enabled: bool,
    pub bind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

/// Korea Investment app credentials, read from the environment only
#[derive(Clone)]
pub struct KisCredentials {
    pub app_key: String,
    pub app_secret: String,
}

impl std::fmt::Debug for KisCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KisCredentials")
            .field("app_key", &"<redacted>")
            .field("app_secret", &"<redacted>")
            .finish()
    }
}

impl AppConfig {
    /// Builder pre-loaded with every default
    pub fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            // Collector defaults
            .set_default("collector.period_ms", 1000)?
            .set_default("collector.fetch_deadline_ms", 900)?
            .set_default("collector.utc_offset_hours", 9)?
            // Source defaults
            .set_default("sources.domestic_enabled", true)?
            .set_default("sources.us_futures_enabled", true)?
            .set_default("sources.gold_spot_enabled", true)?
            .set_default("sources.usd_krw_enabled", true)?
            .set_default("sources.kis.base_url", "https://openapi.koreainvestment.com:9443")?
            .set_default("sources.kis.request_timeout_ms", 800)?
            .set_default("sources.kis.token_file", "./data/kis_token.json")?
            .set_default("sources.kis.token_ttl_hours", 23)?
            .set_default("sources.kis.etf_symbol", "411060")?
            .set_default("sources.kis.gold_spot_symbol", "04020000")?
            .set_default("sources.kis.futures_symbol", "GC")?
            .set_default("sources.kis.futures_exchange", "CMX")?
            .set_default(
                "sources.yahoo.base_url",
                "https://query1.finance.yahoo.com/v8/finance/chart",
            )?
            .set_default("sources.yahoo.symbol", "USDKRW=X")?
            .set_default("sources.yahoo.request_timeout_ms", 800)?
            // Valuation defaults
            .set_default("valuation.reference_source", "gold_spot")?
            .set_default("valuation.gold_holding_per_unit", 14_000)?
            .set_default("valuation.total_units", 100_000)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            // Dashboard defaults
            .set_default("dashboard.enabled", false)?
            .set_default("dashboard.bind", "127.0.0.1:8000")?
            // Logging defaults
            .set_default("logging.json", false)?;
        Ok(builder)
    }

    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (GOLDNAV__*)
            .add_source(Environment::with_prefix("GOLDNAV").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject configurations the collector cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.enabled_sources().is_empty() {
            bail!("No sources enabled; enable at least one of sources.*_enabled");
        }
        if self.collector.period_ms == 0 {
            bail!("collector.period_ms must be greater than zero");
        }
        if self.collector.fetch_deadline_ms == 0 {
            bail!("collector.fetch_deadline_ms must be greater than zero");
        }
        self.reference_source()?;

        if self.collector.fetch_deadline_ms > self.collector.period_ms {
            tracing::warn!(
                period_ms = self.collector.period_ms,
                fetch_deadline_ms = self.collector.fetch_deadline_ms,
                "fetch deadline exceeds cycle period, cycles will overrun when a source stalls"
            );
        }
        for client in self.slow_clients() {
            tracing::warn!(
                client,
                fetch_deadline_ms = self.collector.fetch_deadline_ms,
                "HTTP request timeout is not below the fetch deadline, slow requests surface as timeouts"
            );
        }
        Ok(())
    }

    /// Enabled HTTP clients whose request timeout does not fit inside the fetch deadline
    pub fn slow_clients(&self) -> Vec<&'static str> {
        let deadline = self.collector.fetch_deadline_ms;
        let mut slow = Vec::new();
        if self.needs_kis() && self.sources.kis.request_timeout_ms >= deadline {
            slow.push("kis");
        }
        if self.sources.usd_krw_enabled && self.sources.yahoo.request_timeout_ms >= deadline {
            slow.push("yahoo");
        }
        slow
    }

    /// Sources switched on, in column order
    pub fn enabled_sources(&self) -> Vec<SourceId> {
        SourceId::ALL
            .into_iter()
            .filter(|source| match source {
                SourceId::Domestic => self.sources.domestic_enabled,
                SourceId::UsFutures => self.sources.us_futures_enabled,
                SourceId::GoldSpot => self.sources.gold_spot_enabled,
                SourceId::UsdKrw => self.sources.usd_krw_enabled,
            })
            .collect()
    }

    pub fn reference_source(&self) -> Result<SourceId> {
        SourceId::from_str(&self.valuation.reference_source).with_context(|| {
            format!(
                "Unknown valuation.reference_source '{}'",
                self.valuation.reference_source
            )
        })
    }

    pub fn needs_kis(&self) -> bool {
        self.sources.domestic_enabled
            || self.sources.us_futures_enabled
            || self.sources.gold_spot_enabled
    }

    /// Read KIS credentials from the environment
    pub fn kis_credentials(&self) -> Result<KisCredentials> {
        let app_key = read_env("APP_KEY")?;
        let app_secret = read_env("APP_SECRET")?;
        Ok(KisCredentials {
            app_key,
            app_secret,
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.collector.period_ms)
    }

    pub fn fetch_deadline(&self) -> Duration {
        Duration::from_millis(self.collector.fetch_deadline_ms)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        let sources: Vec<&str> = self.enabled_sources().iter().map(|s| s.key()).collect();
        format!(
            "sources={:?} reference={} period_ms={} deadline_ms={} data_dir={}",
            sources,
            self.valuation.reference_source,
            self.collector.period_ms,
            self.collector.fetch_deadline_ms,
            self.persistence.data_dir
        )
    }
}

fn read_env(var: &str) -> Result<String> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("Required environment variable {} is not set", var),
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}
