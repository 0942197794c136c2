//! Downstream domain store
//!
//! Cumulative per-domain totals written by the aggregator and read by the
//! classification endpoint. Every store remembers the last epoch it applied
//! and ignores an epoch it has already seen, so the aggregator can retry or
//! catch up without double counting.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregator::AggregatedPeriod;
use crate::error::{Error, Result};
use crate::period::Epoch;

/// Cumulative totals of one domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Domain name
    pub name: String,
    /// Delivered events across all applied epochs
    pub delivered: i64,
    /// Bounced events across all applied epochs
    pub bounced: i64,
    /// First epoch the domain appeared in
    pub first_seen: Epoch,
    /// Last epoch the domain appeared in
    pub last_seen: Epoch,
}

/// Write and read contract of the downstream store
pub trait DomainStore: Send + Sync {
    /// Add an aggregated epoch to the cumulative totals.
    ///
    /// Returns `false` without changing anything if an epoch at or after
    /// `period.epoch` was already applied.
    fn apply_period(&self, period: &AggregatedPeriod) -> Result<bool>;

    /// Last applied epoch
    fn last_epoch(&self) -> Result<Option<Epoch>>;

    /// Get the totals of a domain
    fn get(&self, name: &str) -> Result<Option<DomainRecord>>;

    /// Number of known domains
    fn len(&self) -> Result<usize>;

    /// Check if no domain is known
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Serializable store contents
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct StoreState {
    last_epoch: Option<Epoch>,
    domains: BTreeMap<String, DomainRecord>,
}

impl StoreState {
    fn accepts(&self, epoch: Epoch) -> bool {
        self.last_epoch.map_or(true, |last| epoch > last)
    }

    fn merge(&mut self, period: &AggregatedPeriod) {
        for (name, totals) in period.domains() {
            let record = self.domains.entry(name.clone()).or_insert_with(|| DomainRecord {
                name: name.clone(),
                delivered: 0,
                bounced: 0,
                first_seen: period.epoch(),
                last_seen: period.epoch(),
            });
            record.delivered = record.delivered.saturating_add(totals.delivered);
            record.bounced = record.bounced.saturating_add(totals.bounced);
            record.last_seen = period.epoch();
        }
        self.last_epoch = Some(period.epoch());
    }
}

/// Store kept in memory
#[derive(Debug, Default)]
pub struct MemoryDomainStore {
    state: RwLock<StoreState>,
}

impl MemoryDomainStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl DomainStore for MemoryDomainStore {
    fn apply_period(&self, period: &AggregatedPeriod) -> Result<bool> {
        let mut state = self.state.write();
        if !state.accepts(period.epoch()) {
            debug!(epoch = %period.epoch(), "epoch already applied");
            return Ok(false);
        }
        state.merge(period);
        Ok(true)
    }

    fn last_epoch(&self) -> Result<Option<Epoch>> {
        Ok(self.state.read().last_epoch)
    }

    fn get(&self, name: &str) -> Result<Option<DomainRecord>> {
        Ok(self.state.read().domains.get(name).cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.state.read().domains.len())
    }
}

/// Store persisted as a JSON document
#[derive(Debug)]
pub struct JsonDomainStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl JsonDomainStore {
    /// Open a store file, starting empty if it does not exist
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let content = fs::read_to_string(&path)?;
            let state: StoreState = serde_json::from_str(&content)
                .map_err(|e| Error::store(format!("Failed to parse {}: {}", path.display(), e)))?;
            info!(
                path = %path.display(),
                domains = state.domains.len(),
                last_epoch = ?state.last_epoch,
                "loaded domain store"
            );
            state
        } else {
            StoreState::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    /// Get the path of the store file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, state: &StoreState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        {
            let mut writer = BufWriter::new(&file);
            serde_json::to_writer_pretty(&mut writer, state)?;
            writer.flush()?;
        }
        file.sync_all()?;

        fs::rename(&tmp_path, &self.path)
            .map_err(|e| Error::store(format!("Failed to replace {}: {}", self.path.display(), e)))
    }
}

impl DomainStore for JsonDomainStore {
    fn apply_period(&self, period: &AggregatedPeriod) -> Result<bool> {
        let mut state = self.state.write();
        if !state.accepts(period.epoch()) {
            debug!(epoch = %period.epoch(), "epoch already applied");
            return Ok(false);
        }

        // Only publish in memory once the file is durable
        let mut next = state.clone();
        next.merge(period);
        self.write_file(&next)?;
        *state = next;

        Ok(true)
    }

    fn last_epoch(&self) -> Result<Option<Epoch>> {
        Ok(self.state.read().last_epoch)
    }

    fn get(&self, name: &str) -> Result<Option<DomainRecord>> {
        Ok(self.state.read().domains.get(name).cloned())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.state.read().domains.len())
    }
}
