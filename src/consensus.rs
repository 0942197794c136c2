//! Consensus provider contract and a local single-replica provider
//!
//! The state machine itself knows nothing about replication. A provider
//! orders commands, stamps each one with the logical time of its commit and
//! applies it. `LocalCluster` is the in-process provider: it keeps a durable
//! command log plus periodic snapshots, which is enough to run a shard on
//! one node and to exercise restore and replay.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::CatchallConfig;
use crate::error::{Error, Result};
use crate::machine::{Command, EpochInfo, Reply, StateMachine};
use crate::metrics::MetricsCollector;
use crate::period::{util, EpochClock};
use crate::wal::CommandLog;

const LOCK_FILE_NAME: &str = "LOCK";

/// A deterministic state machine driven by a consensus provider
pub trait ReplicatedMachine: Send {
    /// Apply one committed command at logical time `now`
    fn apply(&mut self, now: DateTime<Utc>, command: &Command) -> Result<Reply>;

    /// Serialize the full state
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the full state with a snapshot
    fn restore(&mut self, bytes: &[u8]) -> Result<()>;
}

impl ReplicatedMachine for StateMachine {
    fn apply(&mut self, now: DateTime<Utc>, command: &Command) -> Result<Reply> {
        StateMachine::apply(self, now, command)
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        StateMachine::snapshot(self)
    }

    fn restore(&mut self, bytes: &[u8]) -> Result<()> {
        *self = StateMachine::from_snapshot(self.clock(), bytes)?;
        Ok(())
    }
}

/// Source of commit timestamps
pub trait LogicalClock: Send + Sync {
    /// Get the current logical time
    fn now(&self) -> DateTime<Utc>;
}

/// Logical clock backed by the wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LogicalClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Logical clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock stopped at `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Set the current time
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    /// Move the clock forward
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }
}

impl LogicalClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Durable part of a persistent cluster
struct Storage {
    dir: PathBuf,
    log: CommandLog,
    _lock: File,
}

struct Inner {
    machine: StateMachine,
    applied_index: u64,
    storage: Option<Storage>,
}

/// Single-replica consensus provider
pub struct LocalCluster {
    inner: Mutex<Inner>,
    clock: Arc<dyn LogicalClock>,
    snapshot_threshold: u64,
    metrics: Arc<MetricsCollector>,
}

impl LocalCluster {
    /// Create a cluster that keeps everything in memory
    pub fn in_memory(epochs: EpochClock, clock: Arc<dyn LogicalClock>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                machine: StateMachine::new(epochs),
                applied_index: 0,
                storage: None,
            }),
            clock,
            snapshot_threshold: 0,
            metrics,
        }
    }

    /// Open a persistent cluster in the configured data directory.
    ///
    /// Restores the latest snapshot, then replays the command log. A corrupt
    /// snapshot is fatal: the replica refuses to start with partial state.
    pub fn open(
        config: &CatchallConfig,
        clock: Arc<dyn LogicalClock>,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;
        let dir = config
            .data_dir
            .clone()
            .ok_or_else(|| Error::config("A data directory is required for a persistent cluster"))?;
        let epochs = config.clock()?;

        fs::create_dir_all(&dir)?;
        let lock = Self::lock_dir(&dir)?;

        let (mut machine, snapshot_index) = match util::latest_snapshot_file(&dir)? {
            Some((_, path)) => {
                let (index, payload) = util::load_snapshot(&path)?;
                let machine = StateMachine::from_snapshot(epochs, &payload).map_err(|e| {
                    error!(path = %path.display(), error = %e, "failed to restore snapshot");
                    e
                })?;
                info!(path = %path.display(), index, "restored snapshot");
                (machine, index)
            }
            None => (StateMachine::new(epochs), 0),
        };

        let (log, entries) = CommandLog::open(&dir, config.sync_writes, metrics.clone())?;

        let mut applied_index = snapshot_index.max(log.base_index());
        let mut replayed = 0;
        for entry in entries {
            if entry.index <= applied_index {
                continue;
            }
            if let Err(e) = machine.apply(entry.timestamp, &entry.command) {
                // Rejected when first applied too
                debug!(index = entry.index, error = %e, "replayed command rejected");
            }
            applied_index = entry.index;
            replayed += 1;
        }
        metrics.add_replayed_entries(replayed);

        info!(
            dir = %dir.display(),
            applied_index,
            replayed,
            epochs = machine.periods().len(),
            "opened local cluster"
        );

        Ok(Self {
            inner: Mutex::new(Inner {
                machine,
                applied_index,
                storage: Some(Storage {
                    dir,
                    log,
                    _lock: lock,
                }),
            }),
            clock,
            snapshot_threshold: config.snapshot_threshold,
            metrics,
        })
    }

    /// Parse and apply a raw command
    pub fn execute<S: AsRef<str>>(&self, args: &[S]) -> Result<Reply> {
        let command = match Command::parse(args) {
            Ok(command) => command,
            Err(e) => {
                self.metrics.increment_rejected();
                return Err(e);
            }
        };
        self.apply(&command)
    }

    /// Commit and apply a command.
    ///
    /// Writes are logged before they are applied, so a rejected write stays
    /// in the log and is rejected again on replay.
    pub fn apply(&self, command: &Command) -> Result<Reply> {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        let start = Instant::now();

        if command.is_write() {
            let index = match inner.storage {
                Some(ref storage) => storage.log.append(&now, command)?,
                None => inner.applied_index + 1,
            };
            inner.applied_index = index;
        }

        let result = inner.machine.apply(now, command);

        match result {
            Ok(_) => self.metrics.record_command(command.name(), start.elapsed()),
            Err(_) => self.metrics.increment_rejected(),
        }

        if command.is_write() && self.should_snapshot(&inner) {
            if let Err(e) = Self::snapshot_locked(&inner, &self.metrics) {
                warn!(error = %e, "automatic snapshot failed");
            }
        }

        result
    }

    /// Take a snapshot of the current state.
    ///
    /// For a persistent cluster the snapshot is written to the data directory
    /// and the command log is compacted.
    pub fn snapshot(&self) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        Self::snapshot_locked(&inner, &self.metrics)
    }

    /// Replace the replica state with a snapshot from another replica
    pub fn install_snapshot(&self, bytes: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        ReplicatedMachine::restore(&mut inner.machine, bytes)?;
        info!(epochs = inner.machine.periods().len(), "installed snapshot");

        if inner.storage.is_some() {
            Self::snapshot_locked(&inner, &self.metrics)?;
        }
        Ok(())
    }

    /// Get the epoch bookkeeping
    pub fn info(&self) -> EpochInfo {
        self.inner.lock().machine.info()
    }

    /// Get a copy of the state machine
    pub fn state(&self) -> StateMachine {
        self.inner.lock().machine.clone()
    }

    /// Get the index of the last committed write
    pub fn applied_index(&self) -> u64 {
        self.inner.lock().applied_index
    }

    /// Get the data directory of a persistent cluster
    pub fn data_dir(&self) -> Option<PathBuf> {
        self.inner.lock().storage.as_ref().map(|s| s.dir.clone())
    }

    /// Get the metrics collector
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    // Helper methods

    fn should_snapshot(&self, inner: &Inner) -> bool {
        match inner.storage {
            Some(ref storage) => self.snapshot_threshold > 0 && storage.log.len() >= self.snapshot_threshold,
            None => false,
        }
    }

    fn snapshot_locked(inner: &Inner, metrics: &MetricsCollector) -> Result<Vec<u8>> {
        let start = Instant::now();
        let bytes = inner.machine.snapshot()?;

        if let Some(ref storage) = inner.storage {
            let path = util::save_snapshot(&storage.dir, inner.applied_index, &bytes)?;
            storage.log.reset(inner.applied_index)?;
            info!(path = %path.display(), index = inner.applied_index, bytes = bytes.len(), "wrote snapshot");
        }

        metrics.record_snapshot(bytes.len(), start.elapsed());
        Ok(bytes)
    }

    fn lock_dir(dir: &Path) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(LOCK_FILE_NAME))?;

        file.try_lock_exclusive().map_err(|e| {
            Error::other(format!("Data directory {} is in use: {}", dir.display(), e))
        })?;

        Ok(file)
    }
}
