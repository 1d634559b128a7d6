//! CSV Persistence Module
//!
//! Append-only time series of cycle aggregates. One row per persisted cycle,
//! written to daily files under `<data_dir>/cycles/cycles_YYYY-MM-DD.csv`.
//! Rows are never updated or deleted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::oracle::{CycleAggregate, Snapshot};
use crate::types::{local_now, SourceId};
use crate::valuation::NavStatus;

const CYCLES_DIR: &str = "cycles";
const FILE_PREFIX: &str = "cycles_";
/// Rows kept in memory to answer `most_recent` without touching disk
const RECENT_CAPACITY: usize = 1024;

/// One persisted cycle.
///
/// Absent values are empty cells, never zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: u64,
    pub cycle_timestamp: DateTime<FixedOffset>,
    pub created_at: DateTime<FixedOffset>,
    // Domestic gold ETF
    pub domestic_current_price: Option<f64>,
    pub domestic_bid_price: Option<f64>,
    pub domestic_bid_size: Option<f64>,
    pub domestic_ask_price: Option<f64>,
    pub domestic_ask_size: Option<f64>,
    // COMEX gold futures
    pub us_futures_current_price: Option<f64>,
    pub us_futures_bid_price: Option<f64>,
    pub us_futures_bid_size: Option<f64>,
    pub us_futures_ask_price: Option<f64>,
    pub us_futures_ask_size: Option<f64>,
    // KRX gold spot
    pub gold_spot_current_price: Option<f64>,
    pub gold_spot_bid_price: Option<f64>,
    pub gold_spot_bid_size: Option<f64>,
    pub gold_spot_ask_price: Option<f64>,
    pub gold_spot_ask_size: Option<f64>,
    // USD/KRW
    pub usd_krw_current_price: Option<f64>,
    pub usd_krw_bid_price: Option<f64>,
    pub usd_krw_bid_size: Option<f64>,
    pub usd_krw_ask_price: Option<f64>,
    pub usd_krw_ask_size: Option<f64>,
    // Derived NAV
    pub nav_value: Option<f64>,
    pub nav_status: Option<NavStatus>,
}

type QuoteColumns = (
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
    Option<f64>,
);

fn columns(snapshot: Option<&Snapshot>) -> QuoteColumns {
    match snapshot {
        Some(s) => (
            s.current_price(),
            s.bid_price(),
            s.bid_size(),
            s.ask_price(),
            s.ask_size(),
        ),
        None => (None, None, None, None, None),
    }
}

impl CycleRecord {
    pub fn from_aggregate(
        id: u64,
        created_at: DateTime<FixedOffset>,
        aggregate: &CycleAggregate,
    ) -> Self {
        let domestic = columns(aggregate.snapshot(SourceId::Domestic));
        let futures = columns(aggregate.snapshot(SourceId::UsFutures));
        let spot = columns(aggregate.snapshot(SourceId::GoldSpot));
        let fx = columns(aggregate.snapshot(SourceId::UsdKrw));

        let (nav_value, nav_status) = match &aggregate.nav {
            Some(metric) if metric.is_available() => (Some(metric.value), Some(metric.status)),
            Some(metric) => (None, Some(metric.status)),
            None => (None, None),
        };

        Self {
            id,
            cycle_timestamp: aggregate.cycle_timestamp,
            created_at,
            domestic_current_price: domestic.0,
            domestic_bid_price: domestic.1,
            domestic_bid_size: domestic.2,
            domestic_ask_price: domestic.3,
            domestic_ask_size: domestic.4,
            us_futures_current_price: futures.0,
            us_futures_bid_price: futures.1,
            us_futures_bid_size: futures.2,
            us_futures_ask_price: futures.3,
            us_futures_ask_size: futures.4,
            gold_spot_current_price: spot.0,
            gold_spot_bid_price: spot.1,
            gold_spot_bid_size: spot.2,
            gold_spot_ask_price: spot.3,
            gold_spot_ask_size: spot.4,
            usd_krw_current_price: fx.0,
            usd_krw_bid_price: fx.1,
            usd_krw_bid_size: fx.2,
            usd_krw_ask_price: fx.3,
            usd_krw_ask_size: fx.4,
            nav_value,
            nav_status,
        }
    }

    /// Current price column of one source
    pub fn current_price(&self, source: SourceId) -> Option<f64> {
        match source {
            SourceId::Domestic => self.domestic_current_price,
            SourceId::UsFutures => self.us_futures_current_price,
            SourceId::GoldSpot => self.gold_spot_current_price,
            SourceId::UsdKrw => self.usd_krw_current_price,
        }
    }
}

/// Append-only store of cycle records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CycleStore: Send + Sync {
    /// Durably append one aggregate, assigning its id and creation time
    async fn append(&self, aggregate: CycleAggregate) -> Result<CycleRecord>;

    /// Number of records appended so far
    async fn count(&self) -> Result<u64>;

    /// Last `n` records, newest first
    async fn most_recent(&self, n: usize) -> Result<Vec<CycleRecord>>;
}

struct DailyWriter {
    date: NaiveDate,
    writer: csv::Writer<File>,
}

struct StoreState {
    writer: Option<DailyWriter>,
    count: u64,
    next_id: u64,
    /// Newest at the back
    recent: VecDeque<CycleRecord>,
}

/// CSV-backed cycle store
pub struct CsvCycleStore {
    dir: PathBuf,
    offset: FixedOffset,
    state: Mutex<StoreState>,
}

impl CsvCycleStore {
    /// Open (or create) the store under `data_dir`, recovering count and ids
    pub fn open(data_dir: &str, offset: FixedOffset) -> Result<Self> {
        let dir = PathBuf::from(data_dir).join(CYCLES_DIR);
        fs::create_dir_all(&dir).context("Failed to create cycles directory")?;

        let files = Self::list_files(&dir)?;
        let mut count = 0u64;
        let mut max_id = 0u64;

        for path in &files {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for row in reader.records() {
                match row {
                    Ok(row) => {
                        count += 1;
                        if let Some(id) = row.get(0).and_then(|v| v.parse::<u64>().ok()) {
                            max_id = max_id.max(id);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping unreadable cycle row");
                    }
                }
            }
        }

        let mut recent = VecDeque::new();
        for record in Self::read_newest_first(&files, RECENT_CAPACITY)? {
            recent.push_front(record);
        }

        info!(
            dir = %dir.display(),
            files = files.len(),
            count,
            next_id = max_id + 1,
            "💾 Cycle store opened"
        );

        Ok(Self {
            dir,
            offset,
            state: Mutex::new(StoreState {
                writer: None,
                count,
                next_id: max_id + 1,
                recent,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(date: NaiveDate) -> String {
        format!("{}{}.csv", FILE_PREFIX, date.format("%Y-%m-%d"))
    }

    /// Daily files, oldest first
    fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .with_context(|| format!("Failed reading {}", dir.display()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .map(|n| n.starts_with(FILE_PREFIX) && n.ends_with(".csv"))
                        .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Up to `limit` records walking files newest-first
    fn read_newest_first(files: &[PathBuf], limit: usize) -> Result<Vec<CycleRecord>> {
        let mut out = Vec::new();
        if limit == 0 {
            return Ok(out);
        }

        for path in files.iter().rev() {
            let file = File::open(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

            let mut rows = Vec::new();
            for result in reader.deserialize() {
                match result {
                    Ok(record) => rows.push(record),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to deserialize cycle record");
                    }
                }
            }

            for record in rows.into_iter().rev() {
                out.push(record);
                if out.len() == limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    fn create_writer(dir: &Path, filename: &str) -> Result<csv::Writer<File>> {
        let path = dir.join(filename);
        let file_has_data =
            path.exists() && fs::metadata(&path).map(|m| m.len() > 0).unwrap_or(false);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context("Failed to open CSV file")?;

        let writer = WriterBuilder::new()
            .has_headers(!file_has_data)
            .from_writer(file);

        Ok(writer)
    }

    fn writer_for<'a>(&self, state: &'a mut StoreState, date: NaiveDate) -> Result<&'a mut csv::Writer<File>> {
        // Never rotate backwards: a clock step back keeps writing today's file
        let rotate = match &state.writer {
            Some(current) => date > current.date,
            None => true,
        };
        if rotate {
            let writer = Self::create_writer(&self.dir, &Self::file_name(date))?;
            if state.writer.is_some() {
                info!(date = %date, "Rotating cycle file");
            }
            state.writer = Some(DailyWriter { date, writer });
        }

        state
            .writer
            .as_mut()
            .map(|w| &mut w.writer)
            .context("Cycle writer unavailable")
    }
}

#[async_trait]
impl CycleStore for CsvCycleStore {
    async fn append(&self, aggregate: CycleAggregate) -> Result<CycleRecord> {
        let created_at = local_now(self.offset);
        // Row write and flush run inline while the lock is held. One small row
        // per cycle, and the lock keeps ids and file order in step.
        let mut state = self.state.lock().await;

        let record = CycleRecord::from_aggregate(state.next_id, created_at, &aggregate);
        let written = self
            .writer_for(&mut state, created_at.date_naive())
            .and_then(|writer| {
                writer
                    .serialize(&record)
                    .context("Failed to write cycle record")?;
                writer.flush().context("Failed to flush cycle writer")?;
                Ok(())
            });

        if let Err(e) = written {
            // Reopen on the next append rather than reuse a writer in an unknown state
            state.writer = None;
            return Err(e);
        }

        state.count += 1;
        state.next_id += 1;
        state.recent.push_back(record.clone());
        while state.recent.len() > RECENT_CAPACITY {
            state.recent.pop_front();
        }

        Ok(record)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.state.lock().await.count)
    }

    async fn most_recent(&self, n: usize) -> Result<Vec<CycleRecord>> {
        let state = self.state.lock().await;

        let cached_all = state.recent.len() as u64 == state.count;
        if n <= state.recent.len() || cached_all {
            return Ok(state.recent.iter().rev().take(n).cloned().collect());
        }

        let files = Self::list_files(&self.dir)?;
        Self::read_newest_first(&files, n)
    }
}
