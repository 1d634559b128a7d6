//! Collector integration tests

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;
    use goldnav::collector::{
        Collector, CollectorOptions, CollectorService, CycleOutcome, StatusCache,
    };
    use goldnav::oracle::sources::QuoteSource;
    use goldnav::oracle::{FetchResult, Quote, Snapshot, SourceFailure};
    use goldnav::persistence::{CsvCycleStore, CycleStore};
    use goldnav::types::{offset_from_hours, SourceId};
    use goldnav::valuation::{NavCalculator, NavStatus};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::watch;

    // ============================================================================
    // Fixtures
    // ============================================================================

    /// Source that replays a fixed quote after a fixed latency
    struct ScriptedSource {
        id: SourceId,
        latency: Duration,
        quote: Quote,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(id: SourceId, latency_ms: u64, quote: Quote) -> Arc<Self> {
            Arc::new(Self {
                id,
                latency: Duration::from_millis(latency_ms),
                quote,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn name(&self) -> &'static str {
            "Scripted"
        }

        async fn fetch_snapshot(&self) -> FetchResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            Snapshot::from_quote(self.id, self.quote, Utc::now())
        }
    }

    /// Source whose session renewal always fails
    struct RejectedSource;

    #[async_trait]
    impl QuoteSource for RejectedSource {
        fn id(&self) -> SourceId {
            SourceId::UsdKrw
        }

        fn name(&self) -> &'static str {
            "Rejected"
        }

        async fn fetch_snapshot(&self) -> FetchResult {
            Err(SourceFailure::Auth("token renewal refused".to_string()))
        }
    }

    fn book(price: f64) -> Quote {
        Quote {
            current_price: price,
            bid_price: price - 1.0,
            bid_size: 50.0,
            ask_price: price + 1.0,
            ask_size: 75.0,
        }
    }

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "goldnav_it_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn open_store(dir: &PathBuf) -> Arc<CsvCycleStore> {
        Arc::new(CsvCycleStore::open(dir.to_str().unwrap(), offset_from_hours(9)).unwrap())
    }

    fn collector(sources: Vec<Arc<dyn QuoteSource>>, store: Arc<CsvCycleStore>) -> Collector {
        Collector::new(
            sources,
            NavCalculator::default(),
            store,
            Arc::new(StatusCache::new()),
            CollectorOptions::default(),
        )
    }

    // ============================================================================
    // Fault isolation
    // ============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_fault_isolation_four_sources() {
        let dir = temp_data_dir("fault_isolation");
        let store = open_store(&dir);

        let sources: Vec<Arc<dyn QuoteSource>> = vec![
            ScriptedSource::new(SourceId::Domestic, 20, book(21_500.0)),
            // Times out against the 900ms deadline
            ScriptedSource::new(SourceId::UsFutures, 10_000, book(2_650.0)),
            // All-zero prices
            ScriptedSource::new(SourceId::GoldSpot, 20, Quote::default()),
            ScriptedSource::new(SourceId::UsdKrw, 20, Quote::price_only(1_340.5)),
        ];
        let collector = collector(sources, store.clone());

        let (_tx, mut rx) = watch::channel(false);
        let outcome = collector.run_cycle(&mut rx).await;
        assert_eq!(outcome, CycleOutcome::Persisted { record_id: 1 });

        let rows = store.most_recent(1).await.unwrap();
        let row = &rows[0];
        assert_eq!(row.domestic_current_price, Some(21_500.0));
        assert_eq!(row.domestic_ask_size, Some(75.0));
        assert_eq!(row.us_futures_current_price, None);
        assert_eq!(row.us_futures_bid_price, None);
        assert_eq!(row.gold_spot_current_price, None);
        assert_eq!(row.usd_krw_current_price, Some(1_340.5));
        assert_eq!(row.usd_krw_bid_price, None);
        // Reference source was invalid, so no NAV from any other price
        assert_eq!(row.nav_value, None);
        assert_eq!(row.nav_status, Some(NavStatus::Unavailable));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_contained() {
        let dir = temp_data_dir("auth_failure");
        let store = open_store(&dir);

        let sources: Vec<Arc<dyn QuoteSource>> = vec![
            ScriptedSource::new(SourceId::GoldSpot, 20, book(155_000.0)),
            Arc::new(RejectedSource),
        ];
        let collector = collector(sources, store.clone());

        let (_tx, mut rx) = watch::channel(false);
        collector.run_cycle(&mut rx).await;

        let row = &store.most_recent(1).await.unwrap()[0];
        assert_eq!(row.gold_spot_current_price, Some(155_000.0));
        assert_eq!(row.usd_krw_current_price, None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    // ============================================================================
    // End-to-end valuation
    // ============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_end_to_end_reference_155000() {
        let dir = temp_data_dir("e2e_nav");
        let store = open_store(&dir);

        let sources: Vec<Arc<dyn QuoteSource>> = vec![
            ScriptedSource::new(SourceId::GoldSpot, 30, book(155_000.0)),
            ScriptedSource::new(SourceId::Domestic, 30, book(21_650.0)),
        ];
        let collector = collector(sources, store.clone());

        let (_tx, mut rx) = watch::channel(false);
        collector.run_cycle(&mut rx).await;

        let row = &store.most_recent(1).await.unwrap()[0];
        assert_eq!(row.nav_value, Some(21_700.0));
        assert_eq!(row.nav_status, Some(NavStatus::Ok));
        assert!(row.created_at >= row.cycle_timestamp);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_sources_failing_writes_nothing() {
        let dir = temp_data_dir("no_data");
        let store = open_store(&dir);

        let sources: Vec<Arc<dyn QuoteSource>> = vec![
            ScriptedSource::new(SourceId::GoldSpot, 10, Quote::default()),
            Arc::new(RejectedSource),
        ];
        let collector = collector(sources, store.clone());

        let (_tx, mut rx) = watch::channel(false);
        for _ in 0..3 {
            assert_eq!(collector.run_cycle(&mut rx).await, CycleOutcome::Skipped);
        }
        assert_eq!(store.count().await.unwrap(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    // ============================================================================
    // Service: cadence, ordering, durability
    // ============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_service_count_is_monotonic_and_ordered() {
        let dir = temp_data_dir("service_order");
        let store = open_store(&dir);
        let spot = ScriptedSource::new(SourceId::GoldSpot, 100, book(155_000.0));

        let service = CollectorService::new(collector(vec![spot.clone()], store.clone()));
        assert!(service.latest().await.unwrap().is_none());
        assert!(service.start().await);

        // Sample mid-period so no read lands on a cycle boundary
        tokio::time::sleep(Duration::from_millis(500)).await;
        let mut last_count = service.get_count().await.unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            let count = service.get_count().await.unwrap();
            assert!(count >= last_count);
            last_count = count;
        }

        let counters = service.stop().await.unwrap();
        let count = service.get_count().await.unwrap();
        assert_eq!(count, counters.persisted);
        assert_eq!(spot.calls.load(Ordering::SeqCst) as u64, counters.cycles);

        let latest = service.get_latest(10).await.unwrap();
        assert_eq!(latest.len() as u64, count.min(10));
        assert!(latest.windows(2).all(|w| w[0].id > w[1].id));
        assert_eq!(latest[0].id, count);

        let cached = service.latest().await.unwrap().unwrap();
        assert_eq!(cached.id, latest[0].id);
        assert!(!service.get_status().running);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_survive_restart() {
        let dir = temp_data_dir("restart");

        {
            let store = open_store(&dir);
            let collector = collector(
                vec![ScriptedSource::new(SourceId::GoldSpot, 10, book(160_000.0))],
                store,
            );
            let (_tx, mut rx) = watch::channel(false);
            collector.run_cycle(&mut rx).await;
            collector.run_cycle(&mut rx).await;
        }

        let store = open_store(&dir);
        let service = CollectorService::new(collector(
            vec![ScriptedSource::new(SourceId::GoldSpot, 10, book(161_000.0))],
            store,
        ));

        assert_eq!(service.get_count().await.unwrap(), 2);
        // Cache is empty after restart, the store answers
        let latest = service.latest().await.unwrap().unwrap();
        assert_eq!(latest.id, 2);
        assert_eq!(latest.nav_value, Some(22_400.0));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
