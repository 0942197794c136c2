//! Period table data structures
//!
//! Keeps per-domain counters grouped by epoch. Both levels are ordered maps so
//! scans, extractions and snapshots always see domains in ascending name order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::period::Epoch;

/// Delivered and bounced counters of one domain within one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCounters {
    /// Domain name
    pub name: String,
    /// Number of delivered events
    pub delivered: i64,
    /// Number of bounced events
    pub bounced: i64,
}

impl DomainCounters {
    /// Create zeroed counters for a domain
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delivered: 0,
            bounced: 0,
        }
    }

    /// Create counters with initial values
    pub fn with_counts(name: impl Into<String>, delivered: i64, bounced: i64) -> Self {
        Self {
            name: name.into(),
            delivered,
            bounced,
        }
    }

    /// Add deltas to the counters
    pub fn add(&mut self, delivered: i64, bounced: i64) {
        self.delivered = self.delivered.saturating_add(delivered);
        self.bounced = self.bounced.saturating_add(bounced);
    }

    /// Total number of events
    pub fn total(&self) -> i64 {
        self.delivered.saturating_add(self.bounced)
    }

    /// Flatten into the `[name, delivered, bounced]` wire form
    pub fn to_fields(&self) -> [String; 3] {
        [
            self.name.clone(),
            self.delivered.to_string(),
            self.bounced.to_string(),
        ]
    }
}

/// Counters of every domain seen during one epoch
pub type Period = BTreeMap<String, DomainCounters>;

/// Summary of the resident periods
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodStats {
    /// Number of resident epochs
    pub epoch_count: usize,
    /// Number of domain entries across all epochs
    pub domain_count: usize,
    /// Sum of delivered counters
    pub delivered: i64,
    /// Sum of bounced counters
    pub bounced: i64,
    /// Oldest resident epoch
    pub oldest: Option<Epoch>,
    /// Newest resident epoch
    pub newest: Option<Epoch>,
}

/// Ordered map from epoch to the counters recorded during that epoch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeriodTable {
    periods: BTreeMap<Epoch, Period>,
}

impl PeriodTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resident epochs
    pub fn len(&self) -> usize {
        self.periods.len()
    }

    /// Check if no epoch is resident
    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    /// Check if an epoch is resident
    pub fn contains(&self, epoch: Epoch) -> bool {
        self.periods.contains_key(&epoch)
    }

    /// Get the period of an epoch
    pub fn get(&self, epoch: Epoch) -> Option<&Period> {
        self.periods.get(&epoch)
    }

    /// Resident epochs in ascending order
    pub fn epochs(&self) -> impl Iterator<Item = Epoch> + '_ {
        self.periods.keys().copied()
    }

    /// Iterate over resident periods in epoch order
    pub fn iter(&self) -> impl Iterator<Item = (Epoch, &Period)> + '_ {
        self.periods.iter().map(|(epoch, period)| (*epoch, period))
    }

    /// Get the period of an epoch, creating it if absent.
    ///
    /// The flag is `true` when the period was created by this call.
    pub fn get_or_create(&mut self, epoch: Epoch) -> (&mut Period, bool) {
        let created = !self.periods.contains_key(&epoch);
        (self.periods.entry(epoch).or_default(), created)
    }

    /// Add deltas to a domain's counters within an epoch
    pub fn increment(&mut self, epoch: Epoch, name: &str, delivered: i64, bounced: i64) -> &DomainCounters {
        let (period, _) = self.get_or_create(epoch);
        let counters = period
            .entry(name.to_string())
            .or_insert_with(|| DomainCounters::new(name));
        counters.add(delivered, bounced);
        counters
    }

    /// Counters of an epoch in ascending name order (empty if absent)
    pub fn tuples(&self, epoch: Epoch) -> Vec<DomainCounters> {
        self.periods
            .get(&epoch)
            .map(|period| period.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove an epoch with all its counters
    pub fn remove(&mut self, epoch: Epoch) -> Option<Period> {
        self.periods.remove(&epoch)
    }

    /// Remove every epoch older than `epoch`, returning how many were dropped
    pub fn purge_before(&mut self, epoch: Epoch) -> usize {
        let kept = self.periods.split_off(&epoch);
        let dropped = self.periods.len();
        self.periods = kept;
        dropped
    }

    /// Insert counters restored from a snapshot.
    ///
    /// Returns `false` if the domain already had counters in that epoch.
    pub fn insert_counters(&mut self, epoch: Epoch, counters: DomainCounters) -> bool {
        let (period, _) = self.get_or_create(epoch);
        if period.contains_key(&counters.name) {
            return false;
        }
        period.insert(counters.name.clone(), counters);
        true
    }

    /// Number of domain entries across all epochs
    pub fn domain_count(&self) -> usize {
        self.periods.values().map(|period| period.len()).sum()
    }

    /// Compute statistics about the resident periods
    pub fn stats(&self) -> PeriodStats {
        let mut stats = PeriodStats {
            epoch_count: self.periods.len(),
            oldest: self.periods.keys().next().copied(),
            newest: self.periods.keys().next_back().copied(),
            ..PeriodStats::default()
        };

        for counters in self.periods.values().flat_map(|period| period.values()) {
            stats.domain_count += 1;
            stats.delivered = stats.delivered.saturating_add(counters.delivered);
            stats.bounced = stats.bounced.saturating_add(counters.bounced);
        }

        stats
    }
}

/// Flatten counters into the `[name, delivered, bounced]*` wire sequence
pub fn flatten(tuples: &[DomainCounters]) -> Vec<String> {
    tuples.iter().flat_map(|counters| counters.to_fields()).collect()
}
