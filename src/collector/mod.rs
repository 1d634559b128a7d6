//! Collector - Fixed-cadence acquisition loop
//!
//! Each cycle fans out to every configured source concurrently, waits for all
//! of them to settle within the fetch deadline, assembles the partial results,
//! derives the NAV and appends the aggregate to the store. Per-cycle failures
//! are logged with a `kind` field and never stop the loop.

mod pacing;
mod service;
mod status;

pub use pacing::{pace, Pacing};
pub use service::CollectorService;
pub use status::{CollectorStatus, CycleCounters, Heartbeat, StatusCache};

use anyhow::Result;
use chrono::FixedOffset;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::oracle::sources::QuoteSource;
use crate::oracle::{CycleAggregate, FetchResult, SourceFailure};
use crate::persistence::CycleStore;
use crate::types::{local_now, offset_from_hours, SourceId};
use crate::valuation::NavCalculator;

/// Where the loop is within one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    #[default]
    Idle,
    FannedOut,
    Assembling,
    Valuating,
    Persisting,
}

/// How one cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Persisted { record_id: u64 },
    /// Nothing valid to write
    Skipped,
    PersistFailed,
    /// Stopped while fetches were in flight
    Discarded,
}

#[derive(Debug, Clone)]
pub struct CollectorOptions {
    pub period: Duration,
    pub fetch_deadline: Duration,
    pub reference: SourceId,
    pub utc_offset: FixedOffset,
}

impl CollectorOptions {
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Ok(Self {
            period: cfg.period(),
            fetch_deadline: cfg.fetch_deadline(),
            reference: cfg.reference_source()?,
            utc_offset: offset_from_hours(cfg.collector.utc_offset_hours),
        })
    }
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(1000),
            fetch_deadline: Duration::from_millis(900),
            reference: SourceId::GoldSpot,
            utc_offset: offset_from_hours(9),
        }
    }
}

pub struct Collector {
    sources: Vec<Arc<dyn QuoteSource>>,
    calculator: NavCalculator,
    store: Arc<dyn CycleStore>,
    status: Arc<StatusCache>,
    options: CollectorOptions,
}

/// Resolves once stop is requested. A dropped controller counts as stop.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

fn stop_pending(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow() || stop.has_changed().is_err()
}

impl Collector {
    pub fn new(
        sources: Vec<Arc<dyn QuoteSource>>,
        calculator: NavCalculator,
        store: Arc<dyn CycleStore>,
        status: Arc<StatusCache>,
        options: CollectorOptions,
    ) -> Self {
        Self {
            sources,
            calculator,
            store,
            status,
            options,
        }
    }

    pub fn store(&self) -> Arc<dyn CycleStore> {
        self.store.clone()
    }

    pub fn status(&self) -> Arc<StatusCache> {
        self.status.clone()
    }

    pub fn options(&self) -> &CollectorOptions {
        &self.options
    }

    /// Run every source concurrently and collect one result per source.
    ///
    /// Each fetch is bounded by the fetch deadline and isolated from the
    /// others: a panic or stall in one becomes a failure for that source only.
    async fn fan_out(&self) -> Vec<(SourceId, FetchResult)> {
        let mut tasks = JoinSet::new();
        let mut spawned: HashMap<task::Id, (SourceId, &'static str)> = HashMap::new();
        let deadline = self.options.fetch_deadline;

        for source in &self.sources {
            let fetching = source.clone();
            let handle = tasks.spawn(async move {
                match tokio::time::timeout(deadline, fetching.fetch_snapshot()).await {
                    Ok(result) => result,
                    Err(_elapsed) => Err(SourceFailure::Timeout),
                }
            });
            spawned.insert(handle.id(), (source.id(), source.name()));
        }

        let mut settled: BTreeMap<SourceId, FetchResult> = BTreeMap::new();
        let mut duplicates = Vec::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (task_id, result) = match joined {
                Ok((task_id, result)) => (task_id, result),
                Err(e) => {
                    let reason = if e.is_panic() { "panicked" } else { "cancelled" };
                    (e.id(), Err(SourceFailure::Aborted(format!("fetch task {}", reason))))
                }
            };
            let Some((id, name)) = spawned.remove(&task_id) else {
                warn!(task = %task_id, "Result from an unknown fetch task");
                continue;
            };
            if let Err(SourceFailure::Aborted(reason)) = &result {
                error!(source = %id, venue = name, reason = %reason, "Fetch task aborted");
            }
            if settled.contains_key(&id) {
                duplicates.push((id, result));
            } else {
                settled.insert(id, result);
            }
        }

        let mut ordered: Vec<(SourceId, FetchResult)> = settled.into_iter().collect();
        ordered.extend(duplicates);
        ordered
    }

    /// One full traversal Idle → FannedOut → Assembling → Valuating → Persisting → Idle
    pub async fn run_cycle(&self, stop: &mut watch::Receiver<bool>) -> CycleOutcome {
        let cycle_timestamp = local_now(self.options.utc_offset);

        self.status.set_phase(CyclePhase::FannedOut);
        let results = tokio::select! {
            results = self.fan_out() => results,
            _ = stop_requested(stop) => {
                info!("Stop requested while fetching, discarding cycle");
                let outcome = CycleOutcome::Discarded;
                self.status.finish_cycle(cycle_timestamp, &outcome);
                self.status.set_phase(CyclePhase::Idle);
                return outcome;
            }
        };

        self.status.set_phase(CyclePhase::Assembling);
        let (mut aggregate, failures) = CycleAggregate::assemble(cycle_timestamp, results);
        for (source, failure) in &failures {
            warn!(
                kind = "source_failure",
                source = %source,
                reason = failure.reason(),
                error = %failure,
                "Source produced no snapshot"
            );
        }
        for (source, snapshot) in &aggregate.snapshots {
            if snapshot.degraded_quote() {
                debug!(source = %source, "Degraded quote: price without both book sides");
            }
        }

        self.status.set_phase(CyclePhase::Valuating);
        let reference = self.options.reference;
        let nav = aggregate.attach_nav(&self.calculator, reference);
        if nav.is_available() {
            debug!(nav = nav.value, reference_price = ?nav.reference_price, "NAV computed");
        } else {
            info!(
                kind = "valuation_unavailable",
                reference = %reference,
                "Reference price missing, NAV unavailable"
            );
        }

        let outcome = if !aggregate.is_persistable() {
            warn!(
                kind = "no_data",
                failures = failures.len(),
                "No valid data this cycle, nothing persisted"
            );
            CycleOutcome::Skipped
        } else {
            self.status.set_phase(CyclePhase::Persisting);
            let valid = aggregate.valid_count();
            match self.store.append(aggregate).await {
                Ok(record) => {
                    let record_id = record.id;
                    debug!(id = record_id, valid_sources = valid, nav = ?record.nav_value, "Cycle persisted");
                    self.status.publish(record);
                    CycleOutcome::Persisted { record_id }
                }
                Err(e) => {
                    error!(kind = "persistence_failure", error = %e, "❌ Failed to persist cycle");
                    CycleOutcome::PersistFailed
                }
            }
        };

        self.status.finish_cycle(cycle_timestamp, &outcome);
        self.status.set_phase(CyclePhase::Idle);
        outcome
    }

    /// Run cycles until stop is requested; returns what this run did.
    ///
    /// The `running` flag belongs to [`CollectorService`], not to the loop.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> CycleCounters {
        let mut counters = CycleCounters::default();

        info!(
            sources = ?self.sources.iter().map(|s| s.id().key()).collect::<Vec<_>>(),
            period_ms = self.options.period.as_millis() as u64,
            fetch_deadline_ms = self.options.fetch_deadline.as_millis() as u64,
            reference = %self.options.reference,
            "🚀 Collector started"
        );

        while !stop_pending(&stop) {
            let cycle_start = Instant::now();
            let outcome = self.run_cycle(&mut stop).await;
            counters.record(&outcome);
            if outcome == CycleOutcome::Discarded {
                break;
            }

            match pace(self.options.period, cycle_start.elapsed()) {
                Pacing::Sleep(remaining) => {
                    tokio::select! {
                        _ = tokio::time::sleep(remaining) => {}
                        _ = stop_requested(&mut stop) => break,
                    }
                }
                Pacing::Overrun(by) => {
                    counters.overruns += 1;
                    self.status.record_overrun();
                    warn!(
                        kind = "cycle_overrun",
                        overrun_ms = by.as_millis() as u64,
                        period_ms = self.options.period.as_millis() as u64,
                        "Cycle overran its period, starting next immediately"
                    );
                }
            }
        }

        let rows = match self.store.count().await {
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(error = %e, "Failed to read store count");
                None
            }
        };
        info!(
            cycles = counters.cycles,
            persisted = counters.persisted,
            skipped = counters.skipped,
            persistence_failures = counters.persistence_failures,
            overruns = counters.overruns,
            rows = ?rows,
            "🛑 Collector stopped"
        );

        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{Quote, Snapshot};
    use crate::persistence::{CycleRecord, MockCycleStore};
    use async_trait::async_trait;
    use chrono::Utc;

    struct StubSource {
        id: SourceId,
        delay: Duration,
        quote: Option<Quote>,
    }

    #[async_trait]
    impl QuoteSource for StubSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn name(&self) -> &'static str {
            "Stub"
        }

        async fn fetch_snapshot(&self) -> FetchResult {
            tokio::time::sleep(self.delay).await;
            match self.quote {
                Some(quote) => Snapshot::from_quote(self.id, quote, Utc::now()),
                None => Err(SourceFailure::Http("503".to_string())),
            }
        }
    }

    struct PanickingSource;

    #[async_trait]
    impl QuoteSource for PanickingSource {
        fn id(&self) -> SourceId {
            SourceId::UsFutures
        }

        fn name(&self) -> &'static str {
            "Panicky"
        }

        async fn fetch_snapshot(&self) -> FetchResult {
            panic!("venue payload blew up");
        }
    }

    fn stub(id: SourceId, delay_ms: u64, price: Option<f64>) -> Arc<dyn QuoteSource> {
        Arc::new(StubSource {
            id,
            delay: Duration::from_millis(delay_ms),
            quote: price.map(Quote::price_only),
        })
    }

    fn echo_store() -> MockCycleStore {
        let mut store = MockCycleStore::new();
        let mut next_id = 0u64;
        store.expect_append().returning(move |aggregate| {
            next_id += 1;
            Ok(CycleRecord::from_aggregate(
                next_id,
                aggregate.cycle_timestamp,
                &aggregate,
            ))
        });
        store.expect_count().returning(|| Ok(0));
        store
    }

    fn collector(sources: Vec<Arc<dyn QuoteSource>>, store: MockCycleStore) -> Collector {
        Collector::new(
            sources,
            NavCalculator::default(),
            Arc::new(store),
            Arc::new(StatusCache::new()),
            CollectorOptions::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn empty_cycle_never_appends() {
        let mut store = MockCycleStore::new();
        store.expect_append().never();
        let collector = collector(
            vec![
                stub(SourceId::Domestic, 10, None),
                stub(SourceId::GoldSpot, 10, Some(0.0)),
            ],
            store,
        );

        let (_tx, mut rx) = watch::channel(false);
        let outcome = collector.run_cycle(&mut rx).await;

        assert_eq!(outcome, CycleOutcome::Skipped);
        assert!(collector.status().latest().is_none());
        assert!(collector.status().status().last_cycle_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_source_times_out_without_blocking_others() {
        let collector = collector(
            vec![
                stub(SourceId::Domestic, 50, Some(21_500.0)),
                stub(SourceId::UsFutures, 5_000, Some(2_650.0)),
                stub(SourceId::GoldSpot, 100, Some(155_000.0)),
            ],
            echo_store(),
        );

        let (_tx, mut rx) = watch::channel(false);
        let started = Instant::now();
        let outcome = collector.run_cycle(&mut rx).await;

        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(outcome, CycleOutcome::Persisted { record_id: 1 });

        let latest = collector.status().latest().unwrap();
        assert_eq!(latest.us_futures_current_price, None);
        assert_eq!(latest.domestic_current_price, Some(21_500.0));
        assert_eq!(latest.nav_value, Some(21_700.0));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_source_is_contained() {
        let collector = collector(
            vec![
                Arc::new(PanickingSource),
                stub(SourceId::GoldSpot, 10, Some(160_000.0)),
            ],
            echo_store(),
        );

        let results = collector.fan_out().await;
        let futures = results
            .iter()
            .find(|(id, _)| *id == SourceId::UsFutures)
            .map(|(_, r)| r.clone());
        assert_eq!(futures.map(|r| r.unwrap_err().reason()), Some("aborted"));
        assert!(results
            .iter()
            .any(|(id, r)| *id == SourceId::GoldSpot && r.is_ok()));
    }

    #[tokio::test(start_paused = true)]
    async fn persistence_failure_does_not_stop_the_loop() {
        let mut store = MockCycleStore::new();
        store
            .expect_append()
            .returning(|_| Err(anyhow::anyhow!("disk full")));
        store.expect_count().returning(|| Ok(0));
        let collector = Arc::new(collector(
            vec![stub(SourceId::GoldSpot, 10, Some(155_000.0))],
            store,
        ));

        let (tx, rx) = watch::channel(false);
        let runner = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        tx.send_replace(true);
        let counters = runner.await.unwrap();

        assert!(counters.cycles >= 3, "cycles: {}", counters.cycles);
        assert_eq!(counters.persistence_failures, counters.cycles);
        assert!(collector.status().latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_fan_out_discards_cycle() {
        let mut store = MockCycleStore::new();
        store.expect_append().never();
        store.expect_count().returning(|| Ok(0));
        let collector = Arc::new(collector(
            vec![stub(SourceId::GoldSpot, 500, Some(155_000.0))],
            store,
        ));

        let (tx, rx) = watch::channel(false);
        let runner = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send_replace(true);
        let counters = runner.await.unwrap();

        assert_eq!(counters.discarded, 1);
        assert_eq!(counters.persisted, 0);
        assert_eq!(collector.status().heartbeat().phase, CyclePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_cycle_is_reported_as_overrun() {
        let options = CollectorOptions {
            period: Duration::from_millis(1000),
            fetch_deadline: Duration::from_millis(1500),
            ..CollectorOptions::default()
        };
        let collector = Arc::new(Collector::new(
            vec![stub(SourceId::GoldSpot, 1_400, Some(155_000.0))],
            NavCalculator::default(),
            Arc::new(echo_store()),
            Arc::new(StatusCache::new()),
            options,
        ));

        let (tx, rx) = watch::channel(false);
        let runner = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.run(rx).await })
        };

        // Second cycle starts right after the first at 1.4s, so two finish by 2.9s
        tokio::time::sleep(Duration::from_millis(2_900)).await;
        tx.send_replace(true);
        let counters = runner.await.unwrap();

        assert!(counters.overruns >= 2, "overruns: {}", counters.overruns);
        assert_eq!(counters.persisted, 2);
        assert_eq!(collector.status().heartbeat().counters.overruns, counters.overruns);
    }

    #[tokio::test(start_paused = true)]
    async fn short_cycle_waits_out_the_period() {
        let collector = Arc::new(collector(
            vec![stub(SourceId::GoldSpot, 300, Some(155_000.0))],
            echo_store(),
        ));

        let (tx, rx) = watch::channel(false);
        let runner = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.run(rx).await })
        };

        // Cycles start at 0s, 1s, 2s; the third persists at 2.3s
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tx.send_replace(true);
        let counters = runner.await.unwrap();

        assert_eq!(counters.persisted, 3);
        assert_eq!(counters.overruns, 0);
    }
}
