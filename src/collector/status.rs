//! Status cache shared between the collection loop and readers
//!
//! Holds the most recently persisted record and a heartbeat. Every write
//! replaces the whole value; readers never block the loop.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use super::{CycleOutcome, CyclePhase};
use crate::persistence::CycleRecord;

/// Per-outcome cycle counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleCounters {
    pub cycles: u64,
    pub persisted: u64,
    pub skipped: u64,
    pub persistence_failures: u64,
    pub discarded: u64,
    pub overruns: u64,
}

impl CycleCounters {
    pub fn record(&mut self, outcome: &CycleOutcome) {
        self.cycles += 1;
        match outcome {
            CycleOutcome::Persisted { .. } => self.persisted += 1,
            CycleOutcome::Skipped => self.skipped += 1,
            CycleOutcome::PersistFailed => self.persistence_failures += 1,
            CycleOutcome::Discarded => self.discarded += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Heartbeat {
    pub phase: CyclePhase,
    /// Start time of the last cycle that reached the end of the pipeline
    pub last_cycle_time: Option<DateTime<FixedOffset>>,
    pub counters: CycleCounters,
}

/// What `get_status` reports
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStatus {
    pub running: bool,
    pub last_cycle_time: Option<DateTime<FixedOffset>>,
    pub phase: CyclePhase,
    pub counters: CycleCounters,
}

#[derive(Debug)]
pub struct StatusCache {
    latest: watch::Sender<Option<CycleRecord>>,
    heartbeat: watch::Sender<Heartbeat>,
    running: AtomicBool,
}

impl StatusCache {
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        let (heartbeat, _) = watch::channel(Heartbeat::default());
        Self {
            latest,
            heartbeat,
            running: AtomicBool::new(false),
        }
    }

    /// Replace the cached record
    pub fn publish(&self, record: CycleRecord) {
        self.latest.send_replace(Some(record));
    }

    pub fn latest(&self) -> Option<CycleRecord> {
        self.latest.borrow().clone()
    }

    /// Watch for newly published records
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleRecord>> {
        self.latest.subscribe()
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_phase(&self, phase: CyclePhase) {
        self.heartbeat.send_modify(|hb| hb.phase = phase);
    }

    pub fn finish_cycle(&self, cycle_timestamp: DateTime<FixedOffset>, outcome: &CycleOutcome) {
        self.heartbeat.send_modify(|hb| {
            hb.counters.record(outcome);
            if !matches!(outcome, CycleOutcome::Discarded) {
                hb.last_cycle_time = Some(cycle_timestamp);
            }
        });
    }

    pub fn record_overrun(&self) {
        self.heartbeat.send_modify(|hb| hb.counters.overruns += 1);
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.heartbeat.borrow().clone()
    }

    pub fn status(&self) -> CollectorStatus {
        let hb = self.heartbeat();
        CollectorStatus {
            running: self.is_running(),
            last_cycle_time: hb.last_cycle_time,
            phase: hb.phase,
            counters: hb.counters,
        }
    }
}

impl Default for StatusCache {
    fn default() -> Self {
        Self::new()
    }
}
