//! Configuration for catchall
//!
//! This module provides configuration options for shard replicas and the
//! aggregation master.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::DEFAULT_CATCH_ALL_THRESHOLD;
use crate::error::{Error, Result};
use crate::period::{EpochClock, DEFAULT_BUCKET_SECS};

/// Command used by the aggregator to collect a closed epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    /// `SCAN` every shard, then `EXTRACT` once the store holds the epoch
    Scan,
    /// `EXTRACT`, which lets shards release epochs as they are collected
    Extract,
}

impl Default for AggregationMode {
    fn default() -> Self {
        Self::Scan
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AggregationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "scan" => Ok(Self::Scan),
            "extract" => Ok(Self::Extract),
            _ => Err(Error::config(format!("Unknown aggregation mode: {}", s))),
        }
    }
}

impl AggregationMode {
    /// Get the name of the aggregation mode
    pub fn name(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Extract => "extract",
        }
    }
}

/// What to do when a tick fires while the previous cycle is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Drop the new cycle
    Skip,
    /// Start the new cycle once the running one finishes
    Queue,
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self::Skip
    }
}

impl fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OverlapPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "queue" => Ok(Self::Queue),
            _ => Err(Error::config(format!("Unknown overlap policy: {}", s))),
        }
    }
}

impl OverlapPolicy {
    /// Get the name of the overlap policy
    pub fn name(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Queue => "queue",
        }
    }
}

/// Configuration options for catchall
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct CatchallConfig {
    // Epochs
    /// Length of one epoch in seconds
    pub bucket_secs: u64,

    // Shard replicas
    /// Data directory of a local replica
    pub data_dir: Option<PathBuf>,
    /// Number of logged commands between automatic snapshots (0 disables)
    pub snapshot_threshold: u64,
    /// Whether to sync the command log after every append
    pub sync_writes: bool,

    // Aggregation
    /// Server addresses of every shard, one list per shard
    pub shards: Vec<Vec<String>>,
    /// Maximum concurrent connections per shard
    pub pool_size: usize,
    /// Timeout of a single shard call in milliseconds
    pub call_timeout_ms: u64,
    /// Interval between aggregation cycles in seconds
    pub aggregation_interval_secs: u64,
    /// Command used to collect closed epochs
    pub aggregation_mode: AggregationMode,
    /// Behaviour when cycles overlap
    pub overlap_policy: OverlapPolicy,
    /// Maximum epochs collected by one cycle when catching up
    pub max_epochs_per_cycle: usize,

    // Classification
    /// Delivered events required before a domain is considered catch-all
    pub catch_all_threshold: i64,

    // Additional settings
    /// Enable metrics collection
    pub collect_metrics: bool,
}

impl Default for CatchallConfig {
    fn default() -> Self {
        Self {
            bucket_secs: DEFAULT_BUCKET_SECS,

            data_dir: None,
            snapshot_threshold: 10_000,
            sync_writes: false,

            shards: Vec::new(),
            pool_size: 4,
            call_timeout_ms: 5_000,
            aggregation_interval_secs: DEFAULT_BUCKET_SECS,
            aggregation_mode: AggregationMode::default(),
            overlap_policy: OverlapPolicy::default(),
            max_epochs_per_cycle: 8,

            catch_all_threshold: DEFAULT_CATCH_ALL_THRESHOLD,

            collect_metrics: true,
        }
    }
}

impl CatchallConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the epoch length in seconds
    pub fn with_bucket_secs(mut self, secs: u64) -> Self {
        self.bucket_secs = secs;
        self
    }

    /// Set the replica data directory
    pub fn with_data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the number of logged commands between automatic snapshots
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Set whether to sync the command log after every append
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Add a shard with its server addresses
    pub fn with_shard<S: Into<String>>(mut self, servers: impl IntoIterator<Item = S>) -> Self {
        self.shards.push(servers.into_iter().map(Into::into).collect());
        self
    }

    /// Set the connection pool size per shard
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the shard call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the interval between aggregation cycles in seconds
    pub fn with_aggregation_interval_secs(mut self, secs: u64) -> Self {
        self.aggregation_interval_secs = secs;
        self
    }

    /// Set the aggregation mode
    pub fn with_aggregation_mode(mut self, mode: AggregationMode) -> Self {
        self.aggregation_mode = mode;
        self
    }

    /// Set the overlap policy
    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    /// Set the maximum epochs collected per cycle
    pub fn with_max_epochs_per_cycle(mut self, max: usize) -> Self {
        self.max_epochs_per_cycle = max;
        self
    }

    /// Set the catch-all delivered threshold
    pub fn with_catch_all_threshold(mut self, threshold: i64) -> Self {
        self.catch_all_threshold = threshold;
        self
    }

    /// Set whether to collect metrics
    pub fn with_collect_metrics(mut self, collect: bool) -> Self {
        self.collect_metrics = collect;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bucket_secs < 1 {
            return Err(Error::config("Bucket length must be at least 1 second"));
        }

        if self.shards.iter().any(|servers| servers.is_empty()) {
            return Err(Error::config("Every shard needs at least one server address"));
        }

        if self.pool_size < 1 {
            return Err(Error::config("Pool size must be at least 1"));
        }

        if self.call_timeout_ms < 1 {
            return Err(Error::config("Call timeout must be at least 1ms"));
        }

        if self.call_timeout_ms >= self.bucket_secs.saturating_mul(1000) {
            return Err(Error::config("Call timeout must be shorter than the bucket length"));
        }

        if self.aggregation_interval_secs < 1 {
            return Err(Error::config("Aggregation interval must be at least 1 second"));
        }

        if self.max_epochs_per_cycle < 1 {
            return Err(Error::config("Max epochs per cycle must be at least 1"));
        }

        if self.catch_all_threshold < 1 {
            return Err(Error::config("Catch-all threshold must be at least 1"));
        }

        Ok(())
    }

    /// Get the epoch clock
    pub fn clock(&self) -> Result<EpochClock> {
        EpochClock::new(self.bucket_secs)
    }

    /// Get the shard call timeout as a Duration
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Get the aggregation interval as a Duration
    pub fn aggregation_interval(&self) -> Duration {
        Duration::from_secs(self.aggregation_interval_secs)
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Catchall Configuration ===\n\n");

        result.push_str("Epochs:\n");
        result.push_str(&format!("  Bucket Length: {}s\n", self.bucket_secs));

        result.push_str("\nReplica Settings:\n");
        if let Some(ref dir) = self.data_dir {
            result.push_str(&format!("  Data Directory: {:?}\n", dir));
        }
        result.push_str(&format!("  Snapshot Threshold: {}\n", self.snapshot_threshold));
        result.push_str(&format!("  Sync Writes: {}\n", self.sync_writes));

        result.push_str("\nAggregation:\n");
        result.push_str(&format!("  Shards: {}\n", self.shards.len()));
        for (i, servers) in self.shards.iter().enumerate() {
            result.push_str(&format!("    [{}] {}\n", i, servers.join(", ")));
        }
        result.push_str(&format!("  Pool Size: {}\n", self.pool_size));
        result.push_str(&format!("  Call Timeout: {}ms\n", self.call_timeout_ms));
        result.push_str(&format!("  Interval: {}s\n", self.aggregation_interval_secs));
        result.push_str(&format!("  Mode: {}\n", self.aggregation_mode));
        result.push_str(&format!("  Overlap Policy: {}\n", self.overlap_policy));
        result.push_str(&format!("  Max Epochs per Cycle: {}\n", self.max_epochs_per_cycle));

        result.push_str("\nClassification:\n");
        result.push_str(&format!("  Catch-all Threshold: {}\n", self.catch_all_threshold));

        result.push_str("\nAdditional Settings:\n");
        result.push_str(&format!("  Collect Metrics: {}\n", self.collect_metrics));

        result
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = CatchallConfig::default();

        assert_eq!(config.bucket_secs, 30);
        assert_eq!(config.snapshot_threshold, 10_000);
        assert!(!config.sync_writes);
        assert!(config.shards.is_empty());
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.call_timeout(), Duration::from_secs(5));
        assert_eq!(config.aggregation_interval(), Duration::from_secs(30));
        assert_eq!(config.aggregation_mode, AggregationMode::Scan);
        assert_eq!(config.overlap_policy, OverlapPolicy::Skip);
        assert_eq!(config.catch_all_threshold, 1000);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = CatchallConfig::new()
            .with_bucket_secs(60)
            .with_shard(["10.0.0.1:6379", "10.0.0.2:6379"])
            .with_shard(["10.0.1.1:6379"])
            .with_call_timeout(Duration::from_secs(2))
            .with_aggregation_mode(AggregationMode::Extract)
            .with_overlap_policy(OverlapPolicy::Queue)
            .with_max_epochs_per_cycle(3);

        assert_eq!(config.bucket_secs, 60);
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.shards[0], vec!["10.0.0.1:6379", "10.0.0.2:6379"]);
        assert_eq!(config.call_timeout_ms, 2000);
        assert_eq!(config.aggregation_mode, AggregationMode::Extract);
        assert_eq!(config.overlap_policy, OverlapPolicy::Queue);
        assert_eq!(config.max_epochs_per_cycle, 3);
        assert_eq!(config.clock().unwrap().bucket_length(), Duration::from_secs(60));

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let invalid_configs = vec![
            CatchallConfig::new().with_bucket_secs(0),
            CatchallConfig::new().with_shard(Vec::<String>::new()),
            CatchallConfig::new().with_pool_size(0),
            CatchallConfig::new().with_call_timeout(Duration::ZERO),
            CatchallConfig::new().with_call_timeout(Duration::from_secs(30)),
            CatchallConfig::new().with_aggregation_interval_secs(0),
            CatchallConfig::new().with_max_epochs_per_cycle(0),
            CatchallConfig::new().with_catch_all_threshold(0),
        ];

        for config in invalid_configs {
            assert!(config.validate().is_err(), "{:?}", config);
        }
    }

    #[test]
    fn test_modes_parse() {
        assert_eq!("scan".parse::<AggregationMode>().unwrap(), AggregationMode::Scan);
        assert_eq!("EXTRACT".parse::<AggregationMode>().unwrap(), AggregationMode::Extract);
        assert!("drain".parse::<AggregationMode>().is_err());

        assert_eq!("skip".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Skip);
        assert_eq!("queue".parse::<OverlapPolicy>().unwrap(), OverlapPolicy::Queue);
        assert!("wait".parse::<OverlapPolicy>().is_err());

        assert_eq!(AggregationMode::Extract.to_string(), "extract");
        assert_eq!(OverlapPolicy::Queue.to_string(), "queue");
    }

    #[test]
    fn test_json_file_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("catchall.json");

        let config = CatchallConfig::new()
            .with_shard(["127.0.0.1:7481"])
            .with_aggregation_mode(AggregationMode::Extract);
        config.to_json_file(&path)?;

        assert_eq!(CatchallConfig::from_json_file(&path)?, config);

        // Missing fields fall back to defaults
        fs::write(&path, r#"{"bucket_secs": 10, "call_timeout_ms": 1000}"#)?;
        let partial = CatchallConfig::from_json_file(&path)?;
        assert_eq!(partial.bucket_secs, 10);
        assert_eq!(partial.pool_size, 4);
        Ok(())
    }

    #[test]
    fn test_config_pretty_string() {
        let pretty = CatchallConfig::new().with_shard(["a:1"]).to_string_pretty();

        assert!(pretty.contains("Epochs:"));
        assert!(pretty.contains("Replica Settings:"));
        assert!(pretty.contains("Aggregation:"));
        assert!(pretty.contains("Classification:"));
        assert!(pretty.contains("Mode: scan"));
        assert!(pretty.contains("[0] a:1"));
    }
}
