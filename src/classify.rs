//! Domain classification and event intake
//!
//! The read side turns cumulative totals into a catch-all verdict. The write
//! side maps an event outcome reported for a domain onto a shard increment.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::client::{ClusterClient, Connector};
use crate::error::{Error, Result};
use crate::machine::Command;
use crate::store::{DomainRecord, DomainStore};

/// Default delivered count before a domain without bounces is catch-all
pub const DEFAULT_CATCH_ALL_THRESHOLD: i64 = 1000;

/// Verdict for a sending domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainStatus {
    /// Not enough evidence yet
    Unknown,
    /// Accepts mail for any address
    CatchAll,
    /// Has bounced at least once
    NonCatchAll,
}

impl fmt::Display for DomainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::CatchAll => write!(f, "CatchAll"),
            Self::NonCatchAll => write!(f, "NonCatchAll"),
        }
    }
}

/// Classify a domain from its cumulative counters.
///
/// Any bounce rules out catch-all. Otherwise the domain needs at least
/// `threshold` deliveries to be called catch-all.
pub fn classify(delivered: i64, bounced: i64, threshold: i64) -> DomainStatus {
    if bounced > 0 {
        DomainStatus::NonCatchAll
    } else if delivered < threshold {
        DomainStatus::Unknown
    } else {
        DomainStatus::CatchAll
    }
}

/// Body returned for a domain lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainReport {
    pub status: DomainStatus,
    /// Whether the store knew the domain
    #[serde(skip)]
    pub found: bool,
}

impl DomainReport {
    /// Build a report from a stored record
    pub fn from_record(record: Option<&DomainRecord>, threshold: i64) -> Self {
        match record {
            Some(record) => Self {
                status: classify(record.delivered, record.bounced, threshold),
                found: true,
            },
            None => Self {
                status: DomainStatus::Unknown,
                found: false,
            },
        }
    }

    /// HTTP status code for the lookup
    pub fn http_status(&self) -> u16 {
        if self.found {
            200
        } else {
            404
        }
    }

    /// Render the JSON body
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Look up and classify a domain
pub fn lookup_domain(store: &dyn DomainStore, name: &str, threshold: i64) -> Result<DomainReport> {
    let record = store.get(name)?;
    Ok(DomainReport::from_record(record.as_ref(), threshold))
}

/// Outcome of one delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Delivered,
    Bounced,
}

impl FromStr for EventOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "delivered" => Ok(Self::Delivered),
            "bounced" => Ok(Self::Bounced),
            _ => Err(Error::wrong_arguments(format!("Unknown event outcome: {}", s))),
        }
    }
}

impl fmt::Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => write!(f, "delivered"),
            Self::Bounced => write!(f, "bounced"),
        }
    }
}

impl EventOutcome {
    /// Delivered and bounced deltas for one event
    pub fn deltas(&self) -> (i64, i64) {
        match self {
            Self::Delivered => (1, 0),
            Self::Bounced => (0, 1),
        }
    }

    /// Build the shard command recording one event
    pub fn to_command(&self, domain: &str) -> Result<Command> {
        if domain.is_empty() {
            return Err(Error::wrong_arguments("Event requires a domain name"));
        }
        let (delivered, bounced) = self.deltas();
        Ok(Command::Incr {
            domain: domain.to_string(),
            delivered,
            bounced,
        })
    }
}

/// Record one event for a domain on a shard
pub async fn record_event<C: Connector>(client: &ClusterClient<C>, domain: &str, outcome: EventOutcome) -> Result<()> {
    let command = outcome.to_command(domain)?;
    client.call(&command).await.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{AggregatedPeriod, Aggregator, CycleOutcome};
    use crate::client::{LocalConnector, ShardClient};
    use crate::config::CatchallConfig;
    use crate::consensus::{LocalCluster, LogicalClock, ManualClock};
    use crate::metrics::MetricsCollector;
    use crate::period::{DomainCounters, Epoch, EpochClock};
    use crate::store::{JsonDomainStore, MemoryDomainStore};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_classify() {
        assert_eq!(classify(5000, 1, 1000), DomainStatus::NonCatchAll);
        assert_eq!(classify(999, 0, 1000), DomainStatus::Unknown);
        assert_eq!(classify(1000, 0, 1000), DomainStatus::CatchAll);
        assert_eq!(classify(0, 0, 1000), DomainStatus::Unknown);
    }

    #[test]
    fn test_lookup_domain() -> Result<()> {
        let store = MemoryDomainStore::new();
        let mut period = AggregatedPeriod::new(Epoch::new(1));
        period.merge_shard(
            0,
            &[
                DomainCounters::with_counts("busy.com", 1200, 0),
                DomainCounters::with_counts("strict.com", 10, 2),
            ],
        );
        store.apply_period(&period)?;

        let report = lookup_domain(&store, "busy.com", DEFAULT_CATCH_ALL_THRESHOLD)?;
        assert_eq!(report.status, DomainStatus::CatchAll);
        assert_eq!(report.http_status(), 200);
        assert_eq!(report.to_json()?, r#"{"status":"CatchAll"}"#);

        let report = lookup_domain(&store, "strict.com", DEFAULT_CATCH_ALL_THRESHOLD)?;
        assert_eq!(report.status, DomainStatus::NonCatchAll);

        let report = lookup_domain(&store, "nobody.com", DEFAULT_CATCH_ALL_THRESHOLD)?;
        assert_eq!(report.status, DomainStatus::Unknown);
        assert_eq!(report.http_status(), 404);
        assert_eq!(report.to_json()?, r#"{"status":"Unknown"}"#);
        Ok(())
    }

    #[test]
    fn test_event_outcome() -> Result<()> {
        assert_eq!("delivered".parse::<EventOutcome>()?, EventOutcome::Delivered);
        assert_eq!("Bounced".parse::<EventOutcome>()?, EventOutcome::Bounced);
        assert!("opened".parse::<EventOutcome>().is_err());

        assert_eq!(
            EventOutcome::Bounced.to_command("a.com")?.to_args(),
            vec!["INCR", "a.com", "0", "1"]
        );
        assert!(EventOutcome::Delivered.to_command("").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_record_event() -> Result<()> {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(30_000, 0).unwrap()));
        let metrics = Arc::new(MetricsCollector::new());
        let cluster = Arc::new(LocalCluster::in_memory(EpochClock::default(), clock, metrics.clone()));
        let client = ClusterClient::new(0, LocalConnector::new(cluster.clone()), &CatchallConfig::new(), metrics);

        record_event(&client, "a.com", EventOutcome::Delivered).await?;
        record_event(&client, "a.com", EventOutcome::Delivered).await?;
        record_event(&client, "a.com", EventOutcome::Bounced).await?;

        assert_eq!(
            cluster.state().scan(Epoch::new(1000)),
            vec![DomainCounters::with_counts("a.com", 2, 1)]
        );
        Ok(())
    }

    #[test_log::test]
    fn test_events_reach_lookup_through_persisted_replica() -> Result<()> {
        let dir = tempdir()?;
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(30_000, 0).unwrap()));
        let metrics = Arc::new(MetricsCollector::new());
        let config = CatchallConfig::new()
            .with_data_dir(dir.path().join("shard-0"))
            .with_catch_all_threshold(3);

        let cluster = Arc::new(LocalCluster::open(&config, clock.clone(), metrics.clone())?);
        let client = Arc::new(ClusterClient::new(0, LocalConnector::new(cluster.clone()), &config, metrics.clone()));
        let store = Arc::new(JsonDomainStore::open(dir.path().join("domains.json"))?);
        let shards: Vec<Arc<dyn ShardClient>> = vec![client.clone()];
        let aggregator = Aggregator::new(shards, store.clone(), &config, metrics.clone())?;

        tokio_test::block_on(async {
            for _ in 0..3 {
                record_event(client.as_ref(), "open.com", EventOutcome::Delivered).await?;
            }
            record_event(client.as_ref(), "strict.com", EventOutcome::Delivered).await?;
            record_event(client.as_ref(), "strict.com", EventOutcome::Bounced).await?;

            clock.advance(chrono::Duration::seconds(30));
            let outcome = aggregator.run_cycle(clock.now()).await?;
            assert!(matches!(outcome, CycleOutcome::Completed(_)));
            Ok::<_, Error>(())
        })?;

        let threshold = config.catch_all_threshold;
        assert_eq!(lookup_domain(store.as_ref(), "open.com", threshold)?.status, DomainStatus::CatchAll);
        assert_eq!(lookup_domain(store.as_ref(), "strict.com", threshold)?.status, DomainStatus::NonCatchAll);

        // Totals survive a restart of the store
        drop(aggregator);
        let reopened = JsonDomainStore::open(store.path())?;
        assert_eq!(lookup_domain(&reopened, "open.com", threshold)?.status, DomainStatus::CatchAll);
        Ok(())
    }
}
