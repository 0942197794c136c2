use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::CatchallConfig;

/// Performance metrics collector for catchall
#[derive(Debug)]
pub struct MetricsCollector {
    // Replica operations
    /// Number of INCR commands applied
    incr_count: AtomicUsize,
    /// Number of EXTRACT commands applied
    extract_count: AtomicUsize,
    /// Number of read-only commands applied
    read_count: AtomicUsize,
    /// Number of commands rejected by the state machine
    rejected_count: AtomicUsize,
    /// Total apply duration in nanoseconds
    apply_duration_ns: AtomicU64,

    // Snapshots
    /// Number of snapshots taken
    snapshot_count: AtomicUsize,
    /// Total snapshot duration in nanoseconds
    snapshot_duration_ns: AtomicU64,
    /// Size of the last snapshot in bytes
    last_snapshot_bytes: AtomicUsize,
    /// Number of commands replayed from the log at open
    replayed_entries: AtomicUsize,

    // Command log
    /// Total bytes written to the command log
    wal_bytes_written: AtomicUsize,
    /// Total command log write duration in nanoseconds
    wal_write_duration_ns: AtomicU64,
    /// Total command log sync duration in nanoseconds
    wal_sync_duration_ns: AtomicU64,

    // Aggregation
    /// Number of cycles started
    cycles_started: AtomicUsize,
    /// Number of cycles that published at least one epoch
    cycles_completed: AtomicUsize,
    /// Number of cycles aborted by a shard failure
    cycles_failed: AtomicUsize,
    /// Number of cycles skipped because another was running
    cycles_skipped: AtomicUsize,
    /// Number of epochs merged and published
    epochs_aggregated: AtomicUsize,
    /// Number of domain entries merged
    domains_merged: AtomicUsize,
    /// Total cycle duration in nanoseconds
    cycle_duration_ns: AtomicU64,
    /// Last cycle duration
    last_cycle_duration: Mutex<Duration>,

    // Shard calls
    /// Number of shard calls issued
    shard_calls: AtomicUsize,
    /// Number of shard calls that failed or timed out
    shard_failures: AtomicUsize,
    /// Total shard call duration in nanoseconds
    shard_call_duration_ns: AtomicU64,
    /// Number of connections opened
    connections_opened: AtomicUsize,
    /// Number of connections discarded after a failed call
    connections_discarded: AtomicUsize,

    // Internal state
    /// Start time of the metrics collector
    start_time: Instant,
    /// Whether recording is switched on
    enabled: bool,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Forward a counter increment to the `metrics` facade
#[cfg(feature = "metrics")]
fn export_counter(name: &'static str, value: u64) {
    metrics::counter!(name, value);
}

#[cfg(not(feature = "metrics"))]
fn export_counter(_name: &'static str, _value: u64) {}

/// Forward a duration sample to the `metrics` facade
#[cfg(feature = "metrics")]
fn export_duration(name: &'static str, duration: Duration) {
    metrics::histogram!(name, duration.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
fn export_duration(_name: &'static str, _duration: Duration) {}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            incr_count: AtomicUsize::new(0),
            extract_count: AtomicUsize::new(0),
            read_count: AtomicUsize::new(0),
            rejected_count: AtomicUsize::new(0),
            apply_duration_ns: AtomicU64::new(0),

            snapshot_count: AtomicUsize::new(0),
            snapshot_duration_ns: AtomicU64::new(0),
            last_snapshot_bytes: AtomicUsize::new(0),
            replayed_entries: AtomicUsize::new(0),

            wal_bytes_written: AtomicUsize::new(0),
            wal_write_duration_ns: AtomicU64::new(0),
            wal_sync_duration_ns: AtomicU64::new(0),

            cycles_started: AtomicUsize::new(0),
            cycles_completed: AtomicUsize::new(0),
            cycles_failed: AtomicUsize::new(0),
            cycles_skipped: AtomicUsize::new(0),
            epochs_aggregated: AtomicUsize::new(0),
            domains_merged: AtomicUsize::new(0),
            cycle_duration_ns: AtomicU64::new(0),
            last_cycle_duration: Mutex::new(Duration::from_secs(0)),

            shard_calls: AtomicUsize::new(0),
            shard_failures: AtomicUsize::new(0),
            shard_call_duration_ns: AtomicU64::new(0),
            connections_opened: AtomicUsize::new(0),
            connections_discarded: AtomicUsize::new(0),

            start_time: Instant::now(),
            enabled: true,
        }
    }

    /// Create a collector that ignores every recording call
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Create a collector honouring `collect_metrics`
    pub fn from_config(config: &CatchallConfig) -> Self {
        if config.collect_metrics {
            Self::new()
        } else {
            Self::disabled()
        }
    }

    /// Check if recording is switched on
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    // Replica operations

    /// Record an applied command by name
    pub fn record_command(&self, name: &str, duration: Duration) {
        if !self.enabled {
            return;
        }
        match name {
            "INCR" => {
                self.incr_count.fetch_add(1, Ordering::Relaxed);
                export_counter("catchall_incr_total", 1);
            }
            "EXTRACT" => {
                self.extract_count.fetch_add(1, Ordering::Relaxed);
                export_counter("catchall_extract_total", 1);
            }
            _ => {
                self.read_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.apply_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Increment rejected command count
    pub fn increment_rejected(&self) {
        if !self.enabled {
            return;
        }
        self.rejected_count.fetch_add(1, Ordering::Relaxed);
        export_counter("catchall_rejected_total", 1);
    }

    // Snapshots

    /// Record a snapshot
    pub fn record_snapshot(&self, bytes: usize, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.snapshot_count.fetch_add(1, Ordering::Relaxed);
        self.last_snapshot_bytes.store(bytes, Ordering::Relaxed);
        self.snapshot_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        export_duration("catchall_snapshot_seconds", duration);
    }

    /// Add commands replayed from the log
    pub fn add_replayed_entries(&self, count: usize) {
        if !self.enabled {
            return;
        }
        self.replayed_entries.fetch_add(count, Ordering::Relaxed);
    }

    // Command log

    /// Add command log bytes written
    pub fn add_wal_bytes_written(&self, bytes: usize) {
        if !self.enabled {
            return;
        }
        self.wal_bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a command log write duration
    pub fn record_wal_write_duration(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.wal_write_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record a command log sync duration
    pub fn record_wal_sync_duration(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.wal_sync_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    // Aggregation

    /// Increment started cycle count
    pub fn increment_cycles_started(&self) {
        if !self.enabled {
            return;
        }
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle that published its epochs
    pub fn record_cycle_completed(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.record_cycle_duration(duration);
        export_counter("catchall_cycles_completed_total", 1);
    }

    /// Record a cycle aborted by a failure
    pub fn record_cycle_failed(&self, duration: Duration) {
        if !self.enabled {
            return;
        }
        self.cycles_failed.fetch_add(1, Ordering::Relaxed);
        self.record_cycle_duration(duration);
        export_counter("catchall_cycles_failed_total", 1);
    }

    /// Increment skipped cycle count
    pub fn increment_cycles_skipped(&self) {
        if !self.enabled {
            return;
        }
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
        export_counter("catchall_cycles_skipped_total", 1);
    }

    /// Record an aggregated epoch
    pub fn record_epoch_aggregated(&self, domains: usize) {
        if !self.enabled {
            return;
        }
        self.epochs_aggregated.fetch_add(1, Ordering::Relaxed);
        self.domains_merged.fetch_add(domains, Ordering::Relaxed);
        export_counter("catchall_epochs_aggregated_total", 1);
    }

    fn record_cycle_duration(&self, duration: Duration) {
        self.cycle_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        *self.last_cycle_duration.lock() = duration;
        export_duration("catchall_cycle_seconds", duration);
    }

    // Shard calls

    /// Record a shard call
    pub fn record_shard_call(&self, duration: Duration, ok: bool) {
        if !self.enabled {
            return;
        }
        self.shard_calls.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.shard_failures.fetch_add(1, Ordering::Relaxed);
            export_counter("catchall_shard_failures_total", 1);
        }
        self.shard_call_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        export_duration("catchall_shard_call_seconds", duration);
    }

    /// Increment opened connection count
    pub fn increment_connections_opened(&self) {
        if !self.enabled {
            return;
        }
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment discarded connection count
    pub fn increment_connections_discarded(&self) {
        if !self.enabled {
            return;
        }
        self.connections_discarded.fetch_add(1, Ordering::Relaxed);
    }

    // Getters

    /// Get number of INCR commands applied
    pub fn get_incr_count(&self) -> usize {
        self.incr_count.load(Ordering::Relaxed)
    }

    /// Get number of EXTRACT commands applied
    pub fn get_extract_count(&self) -> usize {
        self.extract_count.load(Ordering::Relaxed)
    }

    /// Get number of read-only commands applied
    pub fn get_read_count(&self) -> usize {
        self.read_count.load(Ordering::Relaxed)
    }

    /// Get number of rejected commands
    pub fn get_rejected_count(&self) -> usize {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Get total apply duration
    pub fn get_apply_duration(&self) -> Duration {
        Duration::from_nanos(self.apply_duration_ns.load(Ordering::Relaxed))
    }

    /// Get number of snapshots taken
    pub fn get_snapshot_count(&self) -> usize {
        self.snapshot_count.load(Ordering::Relaxed)
    }

    /// Get total snapshot duration
    pub fn get_snapshot_duration(&self) -> Duration {
        Duration::from_nanos(self.snapshot_duration_ns.load(Ordering::Relaxed))
    }

    /// Get size of the last snapshot
    pub fn get_last_snapshot_bytes(&self) -> usize {
        self.last_snapshot_bytes.load(Ordering::Relaxed)
    }

    /// Get number of replayed commands
    pub fn get_replayed_entries(&self) -> usize {
        self.replayed_entries.load(Ordering::Relaxed)
    }

    /// Get total command log bytes written
    pub fn get_wal_bytes_written(&self) -> usize {
        self.wal_bytes_written.load(Ordering::Relaxed)
    }

    /// Get total command log write duration
    pub fn get_wal_write_duration(&self) -> Duration {
        Duration::from_nanos(self.wal_write_duration_ns.load(Ordering::Relaxed))
    }

    /// Get total command log sync duration
    pub fn get_wal_sync_duration(&self) -> Duration {
        Duration::from_nanos(self.wal_sync_duration_ns.load(Ordering::Relaxed))
    }

    /// Get number of cycles started
    pub fn get_cycles_started(&self) -> usize {
        self.cycles_started.load(Ordering::Relaxed)
    }

    /// Get number of completed cycles
    pub fn get_cycles_completed(&self) -> usize {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Get number of failed cycles
    pub fn get_cycles_failed(&self) -> usize {
        self.cycles_failed.load(Ordering::Relaxed)
    }

    /// Get number of skipped cycles
    pub fn get_cycles_skipped(&self) -> usize {
        self.cycles_skipped.load(Ordering::Relaxed)
    }

    /// Get number of aggregated epochs
    pub fn get_epochs_aggregated(&self) -> usize {
        self.epochs_aggregated.load(Ordering::Relaxed)
    }

    /// Get number of merged domain entries
    pub fn get_domains_merged(&self) -> usize {
        self.domains_merged.load(Ordering::Relaxed)
    }

    /// Get total cycle duration
    pub fn get_cycle_duration(&self) -> Duration {
        Duration::from_nanos(self.cycle_duration_ns.load(Ordering::Relaxed))
    }

    /// Get last cycle duration
    pub fn get_last_cycle_duration(&self) -> Duration {
        *self.last_cycle_duration.lock()
    }

    /// Get number of shard calls
    pub fn get_shard_calls(&self) -> usize {
        self.shard_calls.load(Ordering::Relaxed)
    }

    /// Get number of failed shard calls
    pub fn get_shard_failures(&self) -> usize {
        self.shard_failures.load(Ordering::Relaxed)
    }

    /// Get total shard call duration
    pub fn get_shard_call_duration(&self) -> Duration {
        Duration::from_nanos(self.shard_call_duration_ns.load(Ordering::Relaxed))
    }

    /// Get number of opened connections
    pub fn get_connections_opened(&self) -> usize {
        self.connections_opened.load(Ordering::Relaxed)
    }

    /// Get number of discarded connections
    pub fn get_connections_discarded(&self) -> usize {
        self.connections_discarded.load(Ordering::Relaxed)
    }

    /// Get shard call failure rate (0.0 - 1.0)
    pub fn get_shard_failure_rate(&self) -> f64 {
        let calls = self.get_shard_calls();
        if calls == 0 {
            return 0.0;
        }
        self.get_shard_failures() as f64 / calls as f64
    }

    /// Get uptime of the metrics collector
    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.incr_count.store(0, Ordering::Relaxed);
        self.extract_count.store(0, Ordering::Relaxed);
        self.read_count.store(0, Ordering::Relaxed);
        self.rejected_count.store(0, Ordering::Relaxed);
        self.apply_duration_ns.store(0, Ordering::Relaxed);

        self.snapshot_count.store(0, Ordering::Relaxed);
        self.snapshot_duration_ns.store(0, Ordering::Relaxed);
        // Don't reset last_snapshot_bytes - it's a current state, not a metric
        self.replayed_entries.store(0, Ordering::Relaxed);

        self.wal_bytes_written.store(0, Ordering::Relaxed);
        self.wal_write_duration_ns.store(0, Ordering::Relaxed);
        self.wal_sync_duration_ns.store(0, Ordering::Relaxed);

        self.cycles_started.store(0, Ordering::Relaxed);
        self.cycles_completed.store(0, Ordering::Relaxed);
        self.cycles_failed.store(0, Ordering::Relaxed);
        self.cycles_skipped.store(0, Ordering::Relaxed);
        self.epochs_aggregated.store(0, Ordering::Relaxed);
        self.domains_merged.store(0, Ordering::Relaxed);
        self.cycle_duration_ns.store(0, Ordering::Relaxed);
        *self.last_cycle_duration.lock() = Duration::from_secs(0);

        self.shard_calls.store(0, Ordering::Relaxed);
        self.shard_failures.store(0, Ordering::Relaxed);
        self.shard_call_duration_ns.store(0, Ordering::Relaxed);
        self.connections_opened.store(0, Ordering::Relaxed);
        self.connections_discarded.store(0, Ordering::Relaxed);
    }

    /// Get a report of all metrics
    pub fn get_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Catchall Metrics Report ===\n\n");

        let uptime = self.get_uptime();
        report.push_str(&format!("Uptime: {:?}\n\n", uptime));

        report.push_str("Replica Operations:\n");
        report.push_str(&format!("  INCR: {}\n", self.get_incr_count()));
        report.push_str(&format!("  EXTRACT: {}\n", self.get_extract_count()));
        report.push_str(&format!("  Reads: {}\n", self.get_read_count()));
        report.push_str(&format!("  Rejected: {}\n", self.get_rejected_count()));
        let applied = self.get_incr_count() + self.get_extract_count() + self.get_read_count();
        if applied > 0 {
            let avg_apply = self.get_apply_duration().as_micros() / applied as u128;
            report.push_str(&format!("  Avg. Apply Time: {}µs\n", avg_apply));
        }

        report.push_str("\nSnapshots:\n");
        report.push_str(&format!("  Taken: {}\n", self.get_snapshot_count()));
        report.push_str(&format!("  Last Size: {} bytes\n", self.get_last_snapshot_bytes()));
        report.push_str(&format!("  Replayed Commands: {}\n", self.get_replayed_entries()));

        report.push_str("\nCommand Log:\n");
        report.push_str(&format!("  Bytes Written: {}\n", self.get_wal_bytes_written()));
        report.push_str(&format!("  Write Time: {:?}\n", self.get_wal_write_duration()));
        report.push_str(&format!("  Sync Time: {:?}\n", self.get_wal_sync_duration()));

        report.push_str("\nAggregation:\n");
        report.push_str(&format!("  Cycles Started: {}\n", self.get_cycles_started()));
        report.push_str(&format!("  Cycles Completed: {}\n", self.get_cycles_completed()));
        report.push_str(&format!("  Cycles Failed: {}\n", self.get_cycles_failed()));
        report.push_str(&format!("  Cycles Skipped: {}\n", self.get_cycles_skipped()));
        report.push_str(&format!("  Epochs Aggregated: {}\n", self.get_epochs_aggregated()));
        report.push_str(&format!("  Domains Merged: {}\n", self.get_domains_merged()));
        report.push_str(&format!("  Last Cycle Time: {:?}\n", self.get_last_cycle_duration()));

        report.push_str("\nShard Calls:\n");
        report.push_str(&format!("  Calls: {}\n", self.get_shard_calls()));
        report.push_str(&format!("  Failure Rate: {:.2}%\n", self.get_shard_failure_rate() * 100.0));
        if self.get_shard_calls() > 0 {
            let avg_call = self.get_shard_call_duration().as_micros() / self.get_shard_calls() as u128;
            report.push_str(&format!("  Avg. Call Time: {}µs\n", avg_call));
        }
        report.push_str(&format!("  Connections Opened: {}\n", self.get_connections_opened()));
        report.push_str(&format!("  Connections Discarded: {}\n", self.get_connections_discarded()));

        let uptime_secs = uptime.as_secs_f64();
        if uptime_secs > 0.0 {
            report.push_str("\nThroughput Metrics:\n");
            report.push_str(&format!("  INCR/sec: {:.2}\n", self.get_incr_count() as f64 / uptime_secs));
        }

        report
    }
}
