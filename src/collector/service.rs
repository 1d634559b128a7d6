//! Collector service - start/stop control and the read API

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::{Collector, CollectorStatus, CycleCounters, StatusCache};
use crate::persistence::{CycleRecord, CycleStore};

struct RunHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<CycleCounters>,
}

/// Hosts the collection loop on a background task
pub struct CollectorService {
    collector: Arc<Collector>,
    store: Arc<dyn CycleStore>,
    status: Arc<StatusCache>,
    handle: Mutex<Option<RunHandle>>,
}

impl CollectorService {
    pub fn new(collector: Collector) -> Self {
        let store = collector.store();
        let status = collector.status();
        Self {
            collector: Arc::new(collector),
            store,
            status,
            handle: Mutex::new(None),
        }
    }

    /// Start the loop. Returns `false` if it was already running.
    pub async fn start(&self) -> bool {
        let mut handle = self.handle.lock().await;
        if let Some(current) = handle.as_ref() {
            if !current.task.is_finished() {
                return false;
            }
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let collector = self.collector.clone();
        self.status.set_running(true);
        let task = tokio::spawn(async move { collector.run(stop_rx).await });

        *handle = Some(RunHandle { stop_tx, task });
        true
    }

    /// Stop the loop and wait for it to reach idle.
    ///
    /// Returns the run's counters, or `None` if nothing was running.
    /// The handle stays locked until the old loop has exited, so a concurrent
    /// `start()` never overlaps two loops.
    pub async fn stop(&self) -> Option<CycleCounters> {
        let mut handle = self.handle.lock().await;
        let current = handle.take()?;

        current.stop_tx.send_replace(true);
        let counters = match current.task.await {
            Ok(counters) => Some(counters),
            Err(e) => {
                error!(error = %e, "Collector task failed");
                None
            }
        };
        self.status.set_running(false);
        info!("Collector service stopped");
        counters
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    /// Last `n` persisted records, newest first
    pub async fn get_latest(&self, n: usize) -> Result<Vec<CycleRecord>> {
        self.store.most_recent(n).await
    }

    pub async fn get_count(&self) -> Result<u64> {
        self.store.count().await
    }

    pub fn get_status(&self) -> CollectorStatus {
        self.status.status()
    }

    /// Latest record from the cache, falling back to the store.
    ///
    /// `Ok(None)` means no data has been recorded yet.
    pub async fn latest(&self) -> Result<Option<CycleRecord>> {
        if let Some(record) = self.status.latest() {
            return Ok(Some(record));
        }
        Ok(self.store.most_recent(1).await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::CollectorOptions;
    use crate::oracle::sources::QuoteSource;
    use crate::oracle::{CycleAggregate, FetchResult, Quote, Snapshot};
    use crate::persistence::MockCycleStore;
    use crate::types::{local_now, offset_from_hours, SourceId};
    use crate::valuation::NavCalculator;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    struct SpotSource;

    #[async_trait]
    impl QuoteSource for SpotSource {
        fn id(&self) -> SourceId {
            SourceId::GoldSpot
        }

        fn name(&self) -> &'static str {
            "Spot"
        }

        async fn fetch_snapshot(&self) -> FetchResult {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Snapshot::from_quote(SourceId::GoldSpot, Quote::price_only(155_000.0), Utc::now())
        }
    }

    fn service(store: MockCycleStore) -> CollectorService {
        CollectorService::new(Collector::new(
            vec![Arc::new(SpotSource)],
            NavCalculator::default(),
            Arc::new(store),
            Arc::new(StatusCache::new()),
            CollectorOptions::default(),
        ))
    }

    /// Store whose appends take a while, recording how many overlap
    #[derive(Default)]
    struct SlowStore {
        appended: AtomicU64,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl CycleStore for SlowStore {
        async fn append(&self, aggregate: CycleAggregate) -> anyhow::Result<CycleRecord> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let id = self.appended.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(CycleRecord::from_aggregate(id, aggregate.cycle_timestamp, &aggregate))
        }

        async fn count(&self) -> anyhow::Result<u64> {
            Ok(self.appended.load(Ordering::SeqCst))
        }

        async fn most_recent(&self, _n: usize) -> anyhow::Result<Vec<CycleRecord>> {
            Ok(Vec::new())
        }
    }

    fn stored(id: u64) -> CycleRecord {
        let now = local_now(offset_from_hours(9));
        CycleRecord::from_aggregate(id, now, &CycleAggregate::new(now))
    }

    #[tokio::test]
    async fn latest_falls_back_to_store_and_reports_no_data() {
        let mut store = MockCycleStore::new();
        store.expect_most_recent().returning(|_| Ok(Vec::new()));
        let service = service(store);

        assert!(service.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_falls_back_to_most_recent_one() {
        let mut store = MockCycleStore::new();
        store
            .expect_most_recent()
            .withf(|n| *n == 1)
            .returning(|_| Ok(vec![stored(41)]));
        let service = service(store);

        let latest = service.latest().await.unwrap();
        assert_eq!(latest.map(|r| r.id), Some(41));
    }

    #[tokio::test]
    async fn stop_without_start_is_a_no_op() {
        let service = service(MockCycleStore::new());
        assert!(service.stop().await.is_none());
        assert!(!service.get_status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let mut store = MockCycleStore::new();
        let mut next_id = 0u64;
        store.expect_append().returning(move |aggregate| {
            next_id += 1;
            Ok(CycleRecord::from_aggregate(next_id, aggregate.cycle_timestamp, &aggregate))
        });
        store.expect_count().returning(|| Ok(1));
        let service = service(store);

        assert!(service.start().await);
        assert!(!service.start().await);
        assert!(service.get_status().running);

        tokio::time::sleep(Duration::from_millis(500)).await;
        let latest = service.latest().await.unwrap();
        assert_eq!(latest.and_then(|r| r.nav_value), Some(21_700.0));
        assert!(service.get_status().last_cycle_time.is_some());

        let counters = service.stop().await.unwrap();
        assert_eq!(counters.persisted, 1);
        assert!(service.stop().await.is_none());
        assert!(!service.get_status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn start_waits_for_an_in_flight_stop() {
        let store = Arc::new(SlowStore::default());
        let service = Arc::new(CollectorService::new(Collector::new(
            vec![Arc::new(SpotSource)],
            NavCalculator::default(),
            store.clone(),
            Arc::new(StatusCache::new()),
            CollectorOptions::default(),
        )));

        assert!(service.start().await);
        // First cycle is now inside its 300ms append
        tokio::time::sleep(Duration::from_millis(100)).await;

        let stopping = {
            let service = service.clone();
            tokio::spawn(async move { service.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Only succeeds once the old loop has exited
        assert!(service.start().await);
        let old_run = stopping.await.unwrap().unwrap();
        assert_eq!(old_run.persisted, 1);
        assert!(service.get_status().running);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(service.get_status().running);

        let new_run = service.stop().await.unwrap();
        assert!(new_run.persisted >= 1);
        assert_eq!(store.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(!service.get_status().running);
    }
}
