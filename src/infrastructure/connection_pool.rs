//! Connection Pool
//!
//! Keeps connections to tablets open between calls and recycles them once
//! they outlive their (jittered) lifetime.

use crate::domain::entities::{Endpoint, TabletAlias};
use crate::domain::errors::QueryError;
use crate::domain::ports::{GatewayMetrics, QueryExecutor, TabletConnection};
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Fraction of the average lifetime a connection's lifetime may deviate by.
pub const LIFETIME_JITTER: f64 = 0.1;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept per tablet
    pub max_idle_per_tablet: usize,
    /// Maximum time a connection can sit idle in the pool
    pub idle_timeout: Duration,
    /// Average connection lifetime
    pub conn_life: Duration,
    /// How often idle and expired connections are swept
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_tablet: 10,
            idle_timeout: Duration::from_secs(300),
            conn_life: Duration::from_secs(365 * 24 * 3600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Longest lifetime any connection can be given.
    pub fn max_lifetime_bound(&self) -> Duration {
        self.conn_life.mul_f64(1.0 + LIFETIME_JITTER)
    }

    /// Pick a lifetime for a new connection so reconnects spread out.
    fn jittered_lifetime(&self) -> Duration {
        let factor = rand::thread_rng().gen_range((1.0 - LIFETIME_JITTER)..=(1.0 + LIFETIME_JITTER));
        self.conn_life.mul_f64(factor)
    }
}

/// A pooled connection, owned by one attempt while checked out.
pub struct PooledConnection {
    /// The underlying tablet connection
    pub conn: Box<dyn TabletConnection>,
    /// When this connection was created
    created_at: Instant,
    /// When this connection was last used
    last_used: Instant,
    /// Lifetime assigned at creation
    max_age: Duration,
    /// Tablet this connection belongs to
    tablet: TabletAlias,
    /// Address the connection was opened to
    addr: String,
}

impl PooledConnection {
    fn new(conn: Box<dyn TabletConnection>, tablet: TabletAlias, addr: String, max_age: Duration) -> Self {
        let now = Instant::now();
        Self {
            conn,
            created_at: now,
            last_used: now,
            max_age,
            tablet,
            addr,
        }
    }

    pub fn tablet(&self) -> &TabletAlias {
        &self.tablet
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Lifetime assigned to this connection.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Check if this connection has exceeded its lifetime.
    pub fn is_expired(&self) -> bool {
        self.age() > self.max_age
    }

    /// Check if this connection has been idle too long.
    pub fn is_idle_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }

    /// Touch the connection to update last_used.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// Per-tablet connection pool.
struct TabletPool {
    /// Idle connections
    idle: Mutex<VecDeque<PooledConnection>>,
    /// Number of connections currently checked out
    in_use: AtomicUsize,
    /// Tablet address
    addr: String,
}

impl TabletPool {
    fn new(addr: String) -> Self {
        Self {
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
            addr,
        }
    }
}

/// Connection pool manager.
pub struct ConnectionPool {
    config: PoolConfig,
    /// Per-tablet pools
    pools: Arc<DashMap<TabletAlias, Arc<TabletPool>>>,
    metrics: Option<Arc<dyn GatewayMetrics>>,
    cleanup_started: AtomicBool,
}

impl ConnectionPool {
    /// Create a new connection pool.
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: Arc::new(DashMap::new()),
            metrics: None,
            cleanup_started: AtomicBool::new(false),
        }
    }

    /// Report opened and closed connections to `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Pool for `endpoint`, plus the pool it replaced if the tablet now
    /// lives at a different address.
    fn pool_for(&self, endpoint: &Endpoint) -> (Arc<TabletPool>, Option<Arc<TabletPool>>) {
        let addr = endpoint.addr();
        let mut entry = self
            .pools
            .entry(endpoint.alias())
            .or_insert_with(|| Arc::new(TabletPool::new(addr.clone())));
        if entry.addr == addr {
            return (entry.value().clone(), None);
        }
        let fresh = Arc::new(TabletPool::new(addr));
        let moved = std::mem::replace(entry.value_mut(), fresh.clone());
        (fresh, Some(moved))
    }

    /// Check out a connection to `endpoint`, opening one through `executor`
    /// if no idle connection is still within its lifetime.
    pub async fn checkout(
        &self,
        endpoint: &Endpoint,
        executor: &dyn QueryExecutor,
        connect_timeout: Duration,
    ) -> Result<PooledConnection, QueryError> {
        self.start_cleanup();
        let tablet = endpoint.alias();
        let (pool, moved) = self.pool_for(endpoint);
        if let Some(old) = moved {
            tracing::info!("tablet {} moved from {} to {}, dropping its idle connections", tablet, old.addr, pool.addr);
            self.close_idle(&old).await;
        }

        let mut evicted = Vec::new();
        let reused = {
            let mut idle = pool.idle.lock().await;
            let mut found = None;
            while let Some(conn) = idle.pop_front() {
                if conn.is_expired() {
                    tracing::debug!("evicting expired connection to {} (age {:?})", tablet, conn.age());
                    evicted.push(conn);
                    continue;
                }
                if conn.is_idle_expired(self.config.idle_timeout) {
                    tracing::debug!("evicting idle connection to {}", tablet);
                    evicted.push(conn);
                    continue;
                }
                found = Some(conn);
                break;
            }
            found
        };

        for conn in evicted {
            self.close(conn).await;
        }

        if let Some(mut conn) = reused {
            conn.touch();
            pool.in_use.fetch_add(1, Ordering::SeqCst);
            return Ok(conn);
        }

        let conn = match tokio::time::timeout(connect_timeout, executor.connect(endpoint, connect_timeout)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(QueryError::Timeout(connect_timeout)),
        };

        if let Some(metrics) = &self.metrics {
            metrics.connection_opened(&tablet);
        }
        pool.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection::new(conn, tablet, pool.addr.clone(), self.config.jittered_lifetime()))
    }

    /// Return a healthy connection to the pool.
    ///
    /// Connections to an address the tablet no longer lives at are closed.
    pub async fn checkin(&self, mut conn: PooledConnection) {
        let Some(pool) = self.current_pool(&conn) else {
            self.close(conn).await;
            return;
        };
        pool.in_use.fetch_sub(1, Ordering::SeqCst);

        if conn.is_expired() {
            self.close(conn).await;
            return;
        }

        conn.touch();

        let overflow = {
            let mut idle = pool.idle.lock().await;
            if idle.len() < self.config.max_idle_per_tablet {
                idle.push_back(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = overflow {
            self.close(conn).await;
        }
    }

    /// Drop a connection after a transport failure.
    pub async fn discard(&self, conn: PooledConnection) {
        if let Some(pool) = self.current_pool(&conn) {
            pool.in_use.fetch_sub(1, Ordering::SeqCst);
        }
        self.close(conn).await;
    }

    /// Forget a tablet that left the topology, closing its idle connections.
    ///
    /// Connections still checked out are closed when they come back.
    pub async fn remove_tablet(&self, tablet: &TabletAlias) -> bool {
        match self.pools.remove(tablet) {
            Some((_, pool)) => {
                self.close_idle(&pool).await;
                true
            }
            None => false,
        }
    }

    fn current_pool(&self, conn: &PooledConnection) -> Option<Arc<TabletPool>> {
        self.pools
            .get(&conn.tablet)
            .map(|p| p.value().clone())
            .filter(|pool| pool.addr == conn.addr)
    }

    async fn close_idle(&self, pool: &TabletPool) {
        let drained: Vec<PooledConnection> = pool.idle.lock().await.drain(..).collect();
        for conn in drained {
            self.close(conn).await;
        }
    }

    async fn close(&self, mut conn: PooledConnection) {
        conn.conn.close().await;
        if let Some(metrics) = &self.metrics {
            metrics.connection_closed(&conn.tablet);
        }
    }

    /// Get pool statistics for a tablet.
    pub async fn stats(&self, tablet: &TabletAlias) -> Option<PoolStats> {
        let pool = self.pools.get(tablet).map(|p| p.value().clone())?;
        let idle = pool.idle.lock().await.len();
        Some(PoolStats {
            in_use: pool.in_use.load(Ordering::SeqCst),
            idle,
            addr: pool.addr.clone(),
        })
    }

    /// Sweep idle and expired connections every `cleanup_interval`, from
    /// the first checkout until the pool is dropped.
    fn start_cleanup(&self) {
        if self.cleanup_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let pools = Arc::downgrade(&self.pools);
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(cleanup_loop(pools, config, metrics));
    }
}

async fn cleanup_loop(
    pools: Weak<DashMap<TabletAlias, Arc<TabletPool>>>,
    config: PoolConfig,
    metrics: Option<Arc<dyn GatewayMetrics>>,
) {
    let mut ticker = tokio::time::interval(config.cleanup_interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(pools) = pools.upgrade() else {
            return;
        };
        let snapshot: Vec<(TabletAlias, Arc<TabletPool>)> = pools
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        drop(pools);

        for (tablet, pool) in snapshot {
            let removed: Vec<PooledConnection> = {
                let mut idle = pool.idle.lock().await;
                let (keep, stale): (VecDeque<_>, VecDeque<_>) = idle
                    .drain(..)
                    .partition(|conn| !conn.is_idle_expired(config.idle_timeout) && !conn.is_expired());
                *idle = keep;
                stale.into_iter().collect()
            };

            if !removed.is_empty() {
                tracing::debug!("pool cleanup for {}: removed {} connections", tablet, removed.len());
            }
            for mut conn in removed {
                conn.conn.close().await;
                if let Some(metrics) = &metrics {
                    metrics.connection_closed(&tablet);
                }
            }
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

/// Pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Connections currently checked out
    pub in_use: usize,
    /// Connections waiting in the pool
    pub idle: usize,
    /// Tablet address
    pub addr: String,
}
