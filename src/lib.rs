//! # catchall_rs
//!
//! Classifies sending domains as catch-all by counting delivered and bounced
//! events per domain.
//!
//! Events are recorded on sharded, replicated state machines that bucket
//! counters into fixed-length epochs. A master periodically collects each
//! closed epoch from every shard, merges the replies and applies the totals
//! to a downstream store, which the classification lookup reads.
//!
//! ```no_run
//! use std::sync::Arc;
//! use catchall_rs::{CatchallConfig, LocalCluster, MetricsCollector, SystemClock};
//!
//! # fn main() -> catchall_rs::Result<()> {
//! let config = CatchallConfig::new().with_data_dir("/var/lib/catchall/shard-0");
//! let metrics = Arc::new(MetricsCollector::new());
//! let cluster = LocalCluster::open(&config, Arc::new(SystemClock), metrics)?;
//!
//! cluster.execute(&["INCR", "example.com", "1", "0"])?;
//! println!("{}", cluster.info());
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod classify;
pub mod client;
pub mod config;
pub mod consensus;
pub mod error;
pub mod machine;
pub mod metrics;
pub mod period;
pub mod store;
pub mod wal;

pub use aggregator::{AggregatedPeriod, Aggregator, CycleOutcome, CycleReport, Totals};
pub use classify::{classify, lookup_domain, record_event, DomainReport, DomainStatus, EventOutcome};
pub use client::{ClusterClient, Connection, Connector, LocalConnector, ShardClient, ShardPool};
pub use config::{AggregationMode, CatchallConfig, OverlapPolicy};
pub use consensus::{LocalCluster, LogicalClock, ManualClock, ReplicatedMachine, SystemClock};
pub use error::{Error, Result};
pub use machine::{Command, EpochInfo, Reply, StateMachine};
pub use metrics::MetricsCollector;
pub use period::{DomainCounters, Epoch, EpochClock, PeriodTable};
pub use store::{DomainRecord, DomainStore, JsonDomainStore, MemoryDomainStore};
