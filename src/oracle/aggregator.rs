//! Cycle aggregation - Reconciles per-source fetch results
//!
//! Folds the settled fetch results of one cycle into a single aggregate that
//! keeps at most one validated snapshot per source, then attaches the NAV
//! computed from the reference source.

use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::oracle::{FetchResult, Snapshot, SourceFailure};
use crate::types::SourceId;
use crate::valuation::{DerivedMetric, NavCalculator};

/// Everything one cycle managed to collect
#[derive(Debug, Clone, Serialize)]
pub struct CycleAggregate {
    /// Wall-clock time the cycle started (not per-source observation time)
    pub cycle_timestamp: DateTime<FixedOffset>,
    pub snapshots: BTreeMap<SourceId, Snapshot>,
    pub nav: Option<DerivedMetric>,
}

impl CycleAggregate {
    pub fn new(cycle_timestamp: DateTime<FixedOffset>) -> Self {
        Self {
            cycle_timestamp,
            snapshots: BTreeMap::new(),
            nav: None,
        }
    }

    /// Build an aggregate from settled fetch results.
    ///
    /// Returns the failures alongside so the caller can report them. A second
    /// result for an already-filled source is dropped.
    pub fn assemble(
        cycle_timestamp: DateTime<FixedOffset>,
        results: Vec<(SourceId, FetchResult)>,
    ) -> (Self, Vec<(SourceId, SourceFailure)>) {
        let mut aggregate = Self::new(cycle_timestamp);
        let mut failures = Vec::new();

        for (source, result) in results {
            match result {
                Ok(snapshot) if snapshot.source() != source => {
                    failures.push((
                        source,
                        SourceFailure::Malformed(format!(
                            "snapshot tagged {} returned by {}",
                            snapshot.source(),
                            source
                        )),
                    ));
                }
                Ok(snapshot) => {
                    if aggregate.snapshots.contains_key(&source) {
                        tracing::warn!(source = %source, "duplicate snapshot in cycle, keeping first");
                        continue;
                    }
                    aggregate.snapshots.insert(source, snapshot);
                }
                Err(failure) => failures.push((source, failure)),
            }
        }

        (aggregate, failures)
    }

    /// Run the calculator against the reference source and attach the result
    pub fn attach_nav(&mut self, calculator: &NavCalculator, reference: SourceId) -> &DerivedMetric {
        let others: Vec<&Snapshot> = self
            .snapshots
            .iter()
            .filter(|(source, _)| **source != reference)
            .map(|(_, snapshot)| snapshot)
            .collect();
        let metric = calculator.compute(self.snapshots.get(&reference), &others);
        self.nav.insert(metric)
    }

    pub fn snapshot(&self, source: SourceId) -> Option<&Snapshot> {
        self.snapshots.get(&source)
    }

    pub fn valid_count(&self) -> usize {
        self.snapshots.len()
    }

    pub fn nav_available(&self) -> bool {
        self.nav.as_ref().map(|m| m.is_available()).unwrap_or(false)
    }

    /// Empty cycles (no snapshot, no usable NAV) are never written
    pub fn is_persistable(&self) -> bool {
        !self.snapshots.is_empty() || self.nav_available()
    }
}
