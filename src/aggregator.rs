//! Scatter-gather aggregation
//!
//! Once per interval the master works out the most recently closed epoch,
//! asks every shard for its counters in parallel and merges the replies into
//! one per-domain view. A cycle is all-or-nothing per epoch: if any shard
//! fails, nothing from that epoch is published or written downstream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::client::{ClusterClient, Connector, ShardClient};
use crate::config::{AggregationMode, CatchallConfig, OverlapPolicy};
use crate::consensus::LogicalClock;
use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::period::{DomainCounters, Epoch, EpochClock};
use crate::store::DomainStore;

/// Merged delivered and bounced totals of one domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub delivered: i64,
    pub bounced: i64,
}

impl Totals {
    /// Add counters into the totals
    pub fn add(&mut self, delivered: i64, bounced: i64) {
        self.delivered = self.delivered.saturating_add(delivered);
        self.bounced = self.bounced.saturating_add(bounced);
    }

    /// Total number of events
    pub fn total(&self) -> i64 {
        self.delivered.saturating_add(self.bounced)
    }
}

/// What one shard added to an aggregated epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardContribution {
    /// Shard position
    pub shard: usize,
    /// Number of domain tuples returned
    pub domains: usize,
    /// Sum of delivered and bounced over all tuples
    pub events: i64,
}

/// Merged counters of every shard for one epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedPeriod {
    epoch: Epoch,
    domains: BTreeMap<String, Totals>,
    contributions: Vec<ShardContribution>,
}

impl AggregatedPeriod {
    /// Create an empty period
    pub fn new(epoch: Epoch) -> Self {
        Self {
            epoch,
            domains: BTreeMap::new(),
            contributions: Vec::new(),
        }
    }

    /// Get the epoch
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Get the merged totals in name order
    pub fn domains(&self) -> &BTreeMap<String, Totals> {
        &self.domains
    }

    /// Get the totals of one domain
    pub fn get(&self, name: &str) -> Option<Totals> {
        self.domains.get(name).copied()
    }

    /// Number of domains
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Check if no domain was reported
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// Get per-shard contributions in merge order
    pub fn contributions(&self) -> &[ShardContribution] {
        &self.contributions
    }

    /// Sum over all domains
    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        for t in self.domains.values() {
            totals.add(t.delivered, t.bounced);
        }
        totals
    }

    /// Merge one shard's reply
    pub fn merge_shard(&mut self, shard: usize, tuples: &[DomainCounters]) -> ShardContribution {
        merge_into(&mut self.domains, tuples);

        let contribution = ShardContribution {
            shard,
            domains: tuples.len(),
            events: tuples.iter().fold(0i64, |acc, c| acc.saturating_add(c.total())),
        };
        self.contributions.push(contribution);
        contribution
    }
}

/// Add tuples into a per-domain map, creating zeroed entries as needed
pub fn merge_into(domains: &mut BTreeMap<String, Totals>, tuples: &[DomainCounters]) {
    for counters in tuples {
        domains
            .entry(counters.name.clone())
            .or_default()
            .add(counters.delivered, counters.bounced);
    }
}

/// Merge shard replies for one epoch
pub fn merge_shards(epoch: Epoch, replies: &[(usize, Vec<DomainCounters>)]) -> AggregatedPeriod {
    let mut period = AggregatedPeriod::new(epoch);
    for (shard, tuples) in replies {
        period.merge_shard(*shard, tuples);
    }
    period
}

/// Phase of the running cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scattering,
    Merging,
}

/// Observable aggregator state
#[derive(Debug, Clone)]
pub struct AggregatorState {
    /// Current phase
    pub phase: Phase,
    /// Last successfully merged epoch
    pub last_period: Option<Arc<AggregatedPeriod>>,
    /// When the last cycle finished
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl Default for AggregatorState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            last_period: None,
            last_cycle_at: None,
        }
    }
}

/// Result of one published epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochReport {
    pub epoch: Epoch,
    pub domains: usize,
    pub contributions: Vec<ShardContribution>,
    /// Whether the downstream store accepted the epoch
    pub applied: bool,
}

/// Result of one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    /// Most recently closed epoch at cycle start
    pub target: Epoch,
    /// Epochs published by this cycle, oldest first
    pub epochs: Vec<EpochReport>,
    /// Epochs left for later cycles
    pub remaining: u64,
}

/// Outcome of a scheduled cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was still running
    Skipped,
}

/// Periodic scatter-gather over every shard
pub struct Aggregator {
    shards: Vec<Arc<dyn ShardClient>>,
    store: Arc<dyn DomainStore>,
    clock: EpochClock,
    mode: AggregationMode,
    overlap: OverlapPolicy,
    interval: std::time::Duration,
    max_epochs_per_cycle: usize,
    state: RwLock<AggregatorState>,
    running: Mutex<()>,
    queued: AtomicBool,
    metrics: Arc<MetricsCollector>,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("shards", &self.shards.len())
            .field("clock", &self.clock)
            .field("mode", &self.mode)
            .field("overlap", &self.overlap)
            .field("interval", &self.interval)
            .field("max_epochs_per_cycle", &self.max_epochs_per_cycle)
            .finish_non_exhaustive()
    }
}

impl Aggregator {
    /// Create an aggregator over `shards`, writing to `store`
    pub fn new(
        shards: Vec<Arc<dyn ShardClient>>,
        store: Arc<dyn DomainStore>,
        config: &CatchallConfig,
        metrics: Arc<MetricsCollector>,
    ) -> Result<Self> {
        config.validate()?;
        if shards.is_empty() {
            return Err(Error::config("At least one shard is required"));
        }

        Ok(Self {
            shards,
            store,
            clock: config.clock()?,
            mode: config.aggregation_mode,
            overlap: config.overlap_policy,
            interval: config.aggregation_interval(),
            max_epochs_per_cycle: config.max_epochs_per_cycle,
            state: RwLock::new(AggregatorState::default()),
            running: Mutex::new(()),
            queued: AtomicBool::new(false),
            metrics,
        })
    }

    /// Create an aggregator with one pooled client per configured shard.
    ///
    /// `connect` receives the shard position and its server addresses and
    /// returns the connector used by that shard's pool.
    pub fn from_config<C, F>(
        config: &CatchallConfig,
        store: Arc<dyn DomainStore>,
        metrics: Arc<MetricsCollector>,
        mut connect: F,
    ) -> Result<Self>
    where
        C: Connector,
        F: FnMut(usize, &[String]) -> Result<C>,
    {
        let mut shards: Vec<Arc<dyn ShardClient>> = Vec::with_capacity(config.shards.len());
        for (id, servers) in config.shards.iter().enumerate() {
            let connector = connect(id, servers)?;
            debug!(shard = id, servers = ?servers, "configured shard");
            shards.push(Arc::new(ClusterClient::new(id, connector, config, metrics.clone())));
        }
        Self::new(shards, store, config, metrics)
    }

    /// Get a copy of the observable state
    pub fn state(&self) -> AggregatorState {
        self.state.read().clone()
    }

    /// Get the last successfully merged epoch
    pub fn last_period(&self) -> Option<Arc<AggregatedPeriod>> {
        self.state.read().last_period.clone()
    }

    /// Get the most recently closed epoch at `now`
    pub fn target_epoch(&self, now: &DateTime<Utc>) -> Result<Epoch> {
        self.clock.epoch_of(now)?.previous()
    }

    /// Ping every shard
    pub async fn check_shards(&self) -> Result<()> {
        let results = join_all(self.shards.iter().map(|shard| shard.ping())).await;
        let mut first_error = None;
        for (shard, result) in self.shards.iter().zip(results) {
            if let Err(e) = result {
                warn!(shard = shard.id(), error = %e, "shard did not answer ping");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Collect and merge one epoch from every shard.
    ///
    /// Fails with the first shard error; nothing is published in that case.
    pub async fn aggregate_period(&self, epoch: Epoch) -> Result<AggregatedPeriod> {
        self.set_phase(Phase::Scattering);

        let calls = self.shards.iter().map(|shard| async move {
            let tuples = self.collect(shard.as_ref(), epoch).await?;
            Ok::<_, Error>((shard.id(), tuples))
        });
        let results = join_all(calls).await;

        let mut replies = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            self.set_phase(Phase::Idle);
            return Err(e);
        }

        self.set_phase(Phase::Merging);
        let period = merge_shards(epoch, &replies);

        for contribution in period.contributions() {
            debug!(
                %epoch,
                shard = contribution.shard,
                domains = contribution.domains,
                events = contribution.events,
                "shard contribution"
            );
        }

        self.set_phase(Phase::Idle);
        Ok(period)
    }

    /// Run one cycle at logical time `now`.
    ///
    /// Works through every epoch after the store's last applied epoch up to
    /// the most recently closed one, at most `max_epochs_per_cycle` at a time,
    /// and stops at the first epoch that fails.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleOutcome> {
        let _guard = match self.overlap {
            OverlapPolicy::Skip => match self.running.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    info!("previous cycle still running, skipping");
                    self.metrics.increment_cycles_skipped();
                    return Ok(CycleOutcome::Skipped);
                }
            },
            OverlapPolicy::Queue => match self.running.try_lock() {
                Ok(guard) => guard,
                // At most one cycle waits behind the running one
                Err(_) if self.queued.swap(true, Ordering::AcqRel) => {
                    info!("a cycle is already queued, skipping");
                    self.metrics.increment_cycles_skipped();
                    return Ok(CycleOutcome::Skipped);
                }
                Err(_) => {
                    let guard = self.running.lock().await;
                    self.queued.store(false, Ordering::Release);
                    guard
                }
            },
        };

        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", %cycle_id);
        self.run_cycle_locked(cycle_id, now)
            .instrument(span)
            .await
            .map(CycleOutcome::Completed)
    }

    async fn run_cycle_locked(&self, cycle_id: Uuid, now: DateTime<Utc>) -> Result<CycleReport> {
        let start = Instant::now();
        self.metrics.increment_cycles_started();

        let target = self.target_epoch(&now)?;
        let first = match self.store.last_epoch()? {
            Some(last) => last.next()?,
            None => target,
        };

        let pending = if first > target {
            0
        } else {
            target.index() - first.index() + 1
        };
        let batch = pending.min(self.max_epochs_per_cycle as u64);

        debug!(%target, %first, pending, "cycle started");

        let mut report = CycleReport {
            cycle_id,
            target,
            epochs: Vec::new(),
            remaining: pending,
        };

        for offset in 0..batch {
            let epoch = Epoch::new(first.index() + offset);

            let period = match self.aggregate_period(epoch).await {
                Ok(period) => period,
                Err(e) => {
                    warn!(%epoch, error = %e, "cycle aborted");
                    self.metrics.record_cycle_failed(start.elapsed());
                    return Err(e);
                }
            };

            let applied = match self.store.apply_period(&period) {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(%epoch, error = %e, "failed to write aggregated epoch");
                    self.metrics.record_cycle_failed(start.elapsed());
                    return Err(e);
                }
            };

            if self.mode == AggregationMode::Scan {
                self.release(epoch).await;
            }

            let totals = period.totals();
            info!(
                %epoch,
                domains = period.len(),
                delivered = totals.delivered,
                bounced = totals.bounced,
                applied,
                "aggregated epoch"
            );
            self.metrics.record_epoch_aggregated(period.len());

            report.epochs.push(EpochReport {
                epoch,
                domains: period.len(),
                contributions: period.contributions().to_vec(),
                applied,
            });
            report.remaining -= 1;

            self.state.write().last_period = Some(Arc::new(period));
        }

        if report.remaining > 0 {
            info!(remaining = report.remaining, "catching up, more epochs next cycle");
        }

        self.state.write().last_cycle_at = Some(now);
        self.metrics.record_cycle_completed(start.elapsed());

        Ok(report)
    }

    /// Run cycles every interval until `shutdown` flips to `true`.
    ///
    /// Each tick runs in its own task, so a slow cycle meets the overlap
    /// policy instead of delaying the schedule. On shutdown every spawned
    /// cycle is awaited before returning.
    pub async fn run(self: Arc<Self>, clock: Arc<dyn LogicalClock>, mut shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.check_shards().await {
            warn!(error = %e, "not every shard is reachable, cycles will retry");
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            shards = self.shards.len(),
            mode = %self.mode,
            interval = ?self.interval,
            "aggregator started"
        );

        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = self.clone();
                    let now = clock.now();
                    cycles.spawn(async move {
                        // Failures are logged inside the cycle
                        let _ = this.run_cycle(now).await;
                    });
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "cycle task panicked");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Let spawned cycles finish
        while let Some(joined) = cycles.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "cycle task panicked");
            }
        }
        info!("aggregator stopped");
    }

    // Helper methods

    async fn collect(&self, shard: &dyn ShardClient, epoch: Epoch) -> Result<Vec<DomainCounters>> {
        match self.mode {
            AggregationMode::Scan => shard.scan(epoch).await,
            AggregationMode::Extract => Self::extract_epoch(shard, epoch).await,
        }
    }

    /// Extract `epoch`, catching the shard's retrieved epoch up if needed.
    ///
    /// A shard refuses to extract its open epoch unless the epoch right
    /// before it was the last one extracted. That happens after a quiet gap
    /// or when an aborted cycle already extracted it. Extracting the closed
    /// previous epoch first satisfies the rule and returns the same tuples.
    async fn extract_epoch(shard: &dyn ShardClient, epoch: Epoch) -> Result<Vec<DomainCounters>> {
        match shard.extract(epoch).await {
            Err(Error::InvalidExtraction(reason)) => match epoch.previous() {
                Ok(previous) => {
                    debug!(shard = shard.id(), %epoch, %reason, "extract refused, releasing previous epoch first");
                    shard.extract(previous).await?;
                    shard.extract(epoch).await
                }
                Err(_) => shard.scan(epoch).await,
            },
            other => other,
        }
    }

    /// Let every shard drop the epochs up to `epoch` once the store has them.
    ///
    /// Failures are only logged: the totals are already durable and the next
    /// release purges everything older anyway.
    async fn release(&self, epoch: Epoch) {
        let results = join_all(
            self.shards
                .iter()
                .map(|shard| Self::extract_epoch(shard.as_ref(), epoch)),
        )
        .await;
        for (shard, result) in self.shards.iter().zip(results) {
            if let Err(e) = result {
                warn!(shard = shard.id(), %epoch, error = %e, "failed to release epoch");
            }
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.state.write().phase = phase;
    }
}
