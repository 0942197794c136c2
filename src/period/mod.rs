//! Epoch-bucketed counter storage
//!
//! This module organizes domain counters into fixed-length time buckets
//! ("epochs"). It holds the epoch clock, the per-shard period table and the
//! binary snapshot codec used for log compaction and replica bootstrap.

mod clock;
mod table;
pub mod codec;
pub mod util;

pub use clock::{Epoch, EpochClock, DEFAULT_BUCKET_SECS, EPOCH_TOKEN_WIDTH};
pub use table::{flatten, DomainCounters, Period, PeriodStats, PeriodTable};
pub use codec::RestoredState;

/// Magic bytes and version for snapshot files
pub(crate) const SNAPSHOT_MAGIC: &[u8; 4] = b"CASN"; // "Catchall Snapshot"
pub(crate) const SNAPSHOT_VERSION: u32 = 1;
