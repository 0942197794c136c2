//! Shard client
//!
//! Typed calls from the aggregation master to one shard. Connections come
//! from a bounded pool; a connection is checked out for exactly one call and
//! goes back to the pool when the guard drops, unless the call broke it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

use crate::config::CatchallConfig;
use crate::consensus::LocalCluster;
use crate::error::{Error, Result};
use crate::machine::{Command, EpochInfo, Reply};
use crate::metrics::MetricsCollector;
use crate::period::{DomainCounters, Epoch};

/// Typed calls against one shard
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// Position of the shard in the cluster list
    fn id(&self) -> usize;

    /// Check that the shard answers
    async fn ping(&self) -> Result<()>;

    /// Read an epoch's counters without changing shard state
    async fn scan(&self, epoch: Epoch) -> Result<Vec<DomainCounters>>;

    /// Read an epoch's counters and let the shard release the epoch before it
    async fn extract(&self, epoch: Epoch) -> Result<Vec<DomainCounters>>;

    /// Get the shard's epoch bookkeeping
    async fn info(&self) -> Result<EpochInfo>;
}

/// A connection able to run one command at a time
#[async_trait]
pub trait Connection: Send + 'static {
    /// Send a command and wait for its reply
    async fn call(&mut self, args: &[String]) -> Result<Reply>;
}

/// Opens new connections to one shard
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector
    type Connection: Connection;

    /// Open a new connection
    async fn connect(&self) -> Result<Self::Connection>;
}

/// Bounded pool of connections to one shard
pub struct ShardPool<C: Connector> {
    connector: C,
    idle: Mutex<Vec<C::Connection>>,
    permits: Semaphore,
    metrics: Arc<MetricsCollector>,
}

impl<C: Connector> ShardPool<C> {
    /// Create a pool allowing `size` connections in use at once
    pub fn new(connector: C, size: usize, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Semaphore::new(size.max(1)),
            metrics,
        }
    }

    /// Check out a connection, opening one if none is idle
    pub async fn get(&self) -> Result<PooledConnection<'_, C>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::other("Connection pool closed"))?;

        let idle = self.idle.lock().pop();
        let connection = match idle {
            Some(connection) => connection,
            None => {
                let connection = self.connector.connect().await?;
                self.metrics.increment_connections_opened();
                connection
            }
        };

        Ok(PooledConnection {
            pool: self,
            connection: Some(connection),
            healthy: true,
            _permit: permit,
        })
    }

    /// Number of idle connections
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of connections that can still be checked out
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// A connection checked out of a pool
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a ShardPool<C>,
    connection: Option<C::Connection>,
    healthy: bool,
    _permit: SemaphorePermit<'a>,
}

impl<C: Connector> PooledConnection<'_, C> {
    /// Run one command on the connection.
    ///
    /// A transport failure, or a call abandoned before it finished, marks the
    /// connection broken so it is discarded instead of reused.
    pub async fn call(&mut self, args: &[String]) -> Result<Reply> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| Error::other("Connection already released"))?;

        self.healthy = false;
        let result = connection.call(args).await;
        self.healthy = match result {
            Ok(_) => true,
            Err(ref e) => e.is_command_error(),
        };
        result
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if self.healthy {
                self.pool.idle.lock().push(connection);
            } else {
                self.pool.metrics.increment_connections_discarded();
            }
        }
    }
}

/// Shard client over a connection pool with a per-call timeout
pub struct ClusterClient<C: Connector> {
    id: usize,
    pool: ShardPool<C>,
    timeout: Duration,
    metrics: Arc<MetricsCollector>,
}

impl<C: Connector> ClusterClient<C> {
    /// Create a client for shard `id`
    pub fn new(id: usize, connector: C, config: &CatchallConfig, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            id,
            pool: ShardPool::new(connector, config.pool_size, metrics.clone()),
            timeout: config.call_timeout(),
            metrics,
        }
    }

    /// Get the connection pool
    pub fn pool(&self) -> &ShardPool<C> {
        &self.pool
    }

    /// Run a command on the shard.
    ///
    /// Transport failures and timeouts come back as `ShardUnavailable`;
    /// errors reported by the shard's state machine are passed through.
    pub async fn call(&self, command: &Command) -> Result<Reply> {
        let args = command.to_args();
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, async {
            let mut connection = self.pool.get().await?;
            connection.call(&args).await
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::shard_unavailable(
                self.id,
                format!("{} timed out after {:?}", command.name(), self.timeout),
            )),
        };

        let result = result.map_err(|e| {
            if e.is_command_error() || e.is_shard_unavailable() {
                e
            } else {
                Error::shard_unavailable(self.id, e.to_string())
            }
        });

        let elapsed = start.elapsed();
        self.metrics.record_shard_call(elapsed, result.is_ok());

        match result {
            Ok(_) => debug!(shard = self.id, command = command.name(), ?elapsed, "shard call"),
            Err(ref e) => warn!(shard = self.id, command = command.name(), error = %e, "shard call failed"),
        }

        result
    }

    /// Record delivered and bounced events for a domain
    pub async fn increment(&self, domain: &str, delivered: i64, bounced: i64) -> Result<()> {
        let command = Command::Incr {
            domain: domain.to_string(),
            delivered,
            bounced,
        };
        match self.call(&command).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(self.id, "INCR", &other)),
        }
    }
}

#[async_trait]
impl<C: Connector> ShardClient for ClusterClient<C> {
    fn id(&self) -> usize {
        self.id
    }

    async fn ping(&self) -> Result<()> {
        match self.call(&Command::Ping).await? {
            Reply::Pong => Ok(()),
            other => Err(unexpected(self.id, "PING", &other)),
        }
    }

    async fn scan(&self, epoch: Epoch) -> Result<Vec<DomainCounters>> {
        let reply = self.call(&Command::Scan { epoch }).await?;
        decode_tuples(self.id, reply)
    }

    async fn extract(&self, epoch: Epoch) -> Result<Vec<DomainCounters>> {
        let reply = self.call(&Command::Extract { epoch }).await?;
        decode_tuples(self.id, reply)
    }

    async fn info(&self) -> Result<EpochInfo> {
        match self.call(&Command::DbInfo).await? {
            Reply::Info(line) => EpochInfo::parse(&line).map_err(|e| Error::shard_unavailable(self.id, e.to_string())),
            other => Err(unexpected(self.id, "DBINFO", &other)),
        }
    }
}

/// Decode a flat `[name, delivered, bounced]*` reply
pub fn decode_tuples(shard: usize, reply: Reply) -> Result<Vec<DomainCounters>> {
    let fields = match reply {
        Reply::Tuples(fields) => fields,
        other => return Err(unexpected(shard, "tuple list", &other)),
    };

    if fields.len() % 3 != 0 {
        return Err(Error::shard_unavailable(
            shard,
            format!("Tuple reply has {} fields, not a multiple of 3", fields.len()),
        ));
    }

    fields
        .chunks_exact(3)
        .map(|chunk| {
            let name = &chunk[0];
            if name.is_empty() {
                return Err(Error::shard_unavailable(shard, "Empty domain name in reply"));
            }
            Ok(DomainCounters::with_counts(
                name.as_str(),
                parse_counter(shard, &chunk[1])?,
                parse_counter(shard, &chunk[2])?,
            ))
        })
        .collect()
}

fn parse_counter(shard: usize, value: &str) -> Result<i64> {
    match value.parse::<i64>() {
        Ok(n) if n >= 0 => Ok(n),
        _ => Err(Error::shard_unavailable(shard, format!("Invalid counter in reply: {:?}", value))),
    }
}

fn unexpected(shard: usize, expected: &str, reply: &Reply) -> Error {
    Error::shard_unavailable(shard, format!("Expected {} reply, got {}", expected, reply))
}

/// Connector to an in-process cluster
#[derive(Clone)]
pub struct LocalConnector {
    cluster: Arc<LocalCluster>,
}

impl LocalConnector {
    /// Create a connector for a local cluster
    pub fn new(cluster: Arc<LocalCluster>) -> Self {
        Self { cluster }
    }
}

/// Connection to an in-process cluster
pub struct LocalConnection {
    cluster: Arc<LocalCluster>,
}

#[async_trait]
impl Connection for LocalConnection {
    async fn call(&mut self, args: &[String]) -> Result<Reply> {
        // Applying may write and sync the command log
        let cluster = self.cluster.clone();
        let args = args.to_vec();
        tokio::task::spawn_blocking(move || cluster.execute(&args))
            .await
            .map_err(|e| Error::other(format!("Local cluster call failed: {}", e)))?
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Connection = LocalConnection;

    async fn connect(&self) -> Result<LocalConnection> {
        Ok(LocalConnection {
            cluster: self.cluster.clone(),
        })
    }
}
