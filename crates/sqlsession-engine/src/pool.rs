//! Connection pool with idle scavenger
//!
//! Idle connections sit on a bounded LIFO stack. A background task sweeps the
//! stack once per idle interval and closes connections that have been idle for
//! at least that long. Connections leave the pool inside a
//! [`ConnectionGuard`], which hands them back when dropped.

use sqlsession_core::{Error, Result};
use sqlsession_storage::{BlockPool, ITEM_BLOCK_LENGTH};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{Connector, StoreConnection};
use crate::metrics::StoreMetrics;
use crate::retry::{Decision, RetryPolicy, RetryState};

/// Hard cap on the idle stack regardless of processor count
const MAX_IDLE_CEILING: usize = 5000;

/// Pool sizing and eviction settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    /// Largest number of idle connections kept
    pub max_idle: usize,
    /// Scavenger period; connections idle this long are closed
    pub idle_timeout: Duration,
    /// Payload blocks kept for reuse
    pub block_cache_capacity: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            idle_timeout: Duration::from_secs(60),
            block_cache_capacity: 1024,
        }
    }
}

impl From<&PoolConfig> for PoolOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_idle: config.max_idle_connections.unwrap_or_else(default_max_idle),
            idle_timeout: config.idle_timeout(),
            block_cache_capacity: config.block_cache_capacity,
        }
    }
}

fn default_max_idle() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    cpus.saturating_mul(100).min(MAX_IDLE_CEILING)
}

struct PooledConnection {
    conn: Box<dyn StoreConnection>,
    last_returned: Instant,
}

struct Scavenger {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Pool of backing-store connections shared by every call of a store
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    options: PoolOptions,
    retry: RetryPolicy,
    // Integrated-security logins are never pooled
    pooling_enabled: bool,
    idle: Mutex<Vec<PooledConnection>>,
    idle_count: AtomicUsize,
    clear_in_progress: AtomicBool,
    closed: AtomicBool,
    blocks: BlockPool,
    metrics: StoreMetrics,
    scavenger: Mutex<Option<Scavenger>>,
}

impl ConnectionPool {
    /// Create a pool without a scavenger task
    pub fn new(
        connector: Arc<dyn Connector>,
        options: PoolOptions,
        retry: RetryPolicy,
        metrics: StoreMetrics,
    ) -> Self {
        let pooling_enabled = !connector.uses_integrated_security();
        if !pooling_enabled {
            info!(
                "Integrated security in use for {}; connections will not be pooled",
                connector.target()
            );
        }

        Self {
            blocks: BlockPool::new(options.block_cache_capacity, ITEM_BLOCK_LENGTH),
            connector,
            options,
            retry,
            pooling_enabled,
            idle: Mutex::new(Vec::new()),
            idle_count: AtomicUsize::new(0),
            clear_in_progress: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics,
            scavenger: Mutex::new(None),
        }
    }

    /// Create a pool and start its scavenger task
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(
        connector: Arc<dyn Connector>,
        options: PoolOptions,
        retry: RetryPolicy,
        metrics: StoreMetrics,
    ) -> Arc<Self> {
        let pool = Arc::new(Self::new(connector, options, retry, metrics));
        pool.start_scavenger();
        pool
    }

    fn start_scavenger(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let pool = Arc::downgrade(self);
        let period = self.options.idle_timeout;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!("Starting idle connection scavenger (interval: {:?})", period);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Idle connection scavenger shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        // The pool is gone once every store handle is dropped
                        let Some(pool) = pool.upgrade() else { break };
                        let evicted = pool.sweep().await;
                        if evicted > 0 {
                            debug!("Scavenger closed {} idle connections", evicted);
                        }
                    }
                }
            }
        });

        *lock(&self.scavenger) = Some(Scavenger {
            shutdown_tx,
            handle,
        });
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Block look-aside shared by every connection of this pool
    pub fn blocks(&self) -> &BlockPool {
        &self.blocks
    }

    pub fn pooling_enabled(&self) -> bool {
        self.pooling_enabled
    }

    /// Number of idle connections, read without taking the lock
    pub fn idle_count(&self) -> usize {
        self.idle_count.load(Ordering::Relaxed)
    }

    pub fn target(&self) -> &str {
        self.connector.target()
    }

    /// Take a connection, opening one when no idle entry is usable
    pub async fn acquire(&self, allow_pooling: bool) -> Result<ConnectionGuard<'_>> {
        let mut retry = RetryState::new(self.retry);
        self.acquire_with_retry(allow_pooling, &mut retry).await
    }

    /// Like [`ConnectionPool::acquire`], charging connect retries to `retry`
    pub async fn acquire_with_retry(
        &self,
        allow_pooling: bool,
        retry: &mut RetryState,
    ) -> Result<ConnectionGuard<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::store_unavailable("connection pool is shut down"));
        }

        let pooled = allow_pooling && self.pooling_enabled;
        if pooled {
            while let Some(mut entry) = self.pop_idle() {
                if entry.conn.is_open() && entry.last_returned.elapsed() < self.options.idle_timeout {
                    return Ok(ConnectionGuard {
                        pool: self,
                        conn: Some(entry.conn),
                        pooled,
                    });
                }
                self.metrics.record_evictions(1);
                entry.conn.close().await;
            }
        }

        let conn = self.connect(retry).await?;
        Ok(ConnectionGuard {
            pool: self,
            conn: Some(conn),
            pooled,
        })
    }

    /// Open a new connection, retrying transient failures
    pub(crate) async fn connect(&self, retry: &mut RetryState) -> Result<Box<dyn StoreConnection>> {
        loop {
            let err = match self.connector.connect().await {
                Ok(conn) => {
                    self.metrics.record_connection_opened();
                    return Ok(conn);
                }
                Err(err) => err,
            };

            let message = err.to_string();
            match retry.on_failure(err, false) {
                Decision::Retry {
                    delay,
                    clear_pool,
                    kind,
                } => {
                    warn!(
                        target_db = %self.connector.target(),
                        backoff_ms = delay.as_millis() as u64,
                        attempt = retry.attempts(),
                        "Cannot connect to session state database, retrying: {}",
                        message
                    );
                    if clear_pool {
                        self.clear().await;
                    }
                    self.metrics.record_backoff(kind);
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail(e) => {
                    tracing::error!(
                        target_db = %self.connector.target(),
                        "Cannot connect to session state database: {}",
                        message
                    );
                    return Err(e);
                }
                Decision::Benign => {
                    return Err(Error::store_unavailable(format!(
                        "unexpected duplicate key while connecting: {}",
                        message
                    )));
                }
            }
        }
    }

    fn pop_idle(&self) -> Option<PooledConnection> {
        let mut idle = lock(&self.idle);
        let entry = idle.pop();
        self.idle_count.store(idle.len(), Ordering::Relaxed);
        self.metrics.set_idle_connections(idle.len());
        entry
    }

    fn release(&self, conn: Box<dyn StoreConnection>, pooled: bool) {
        if !pooled || !conn.is_open() || self.closed.load(Ordering::Acquire) {
            return;
        }

        let mut idle = lock(&self.idle);
        if idle.len() >= self.options.max_idle {
            drop(idle);
            self.metrics.record_pool_full();
            warn!(
                "Connection pool full ({} idle); closing returned connection",
                self.options.max_idle
            );
            return;
        }

        idle.push(PooledConnection {
            conn,
            last_returned: Instant::now(),
        });
        self.idle_count.store(idle.len(), Ordering::Relaxed);
        self.metrics.set_idle_connections(idle.len());
    }

    /// Close idle connections that are closed or idle for the whole interval
    ///
    /// Returns the number of connections evicted. When the sweep leaves the
    /// pool empty the block look-aside is emptied too.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let idle_timeout = self.options.idle_timeout;

        let (evicted, drained) = {
            let mut idle = lock(&self.idle);
            let (stale, fresh): (Vec<_>, Vec<_>) = idle.drain(..).partition(|entry| {
                !entry.conn.is_open() || now.duration_since(entry.last_returned) >= idle_timeout
            });
            *idle = fresh;
            self.idle_count.store(idle.len(), Ordering::Relaxed);
            self.metrics.set_idle_connections(idle.len());
            (stale, idle.is_empty())
        };

        if drained {
            self.blocks.clear();
        }

        let count = evicted.len();
        self.metrics.record_evictions(count);
        for mut entry in evicted {
            entry.conn.close().await;
        }
        count
    }

    /// Close every idle connection
    ///
    /// Only one caller clears at a time; concurrent callers return `false`
    /// immediately.
    pub async fn clear(&self) -> bool {
        if self
            .clear_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let drained: Vec<PooledConnection> = {
            let mut idle = lock(&self.idle);
            let drained = idle.drain(..).collect();
            self.idle_count.store(0, Ordering::Relaxed);
            self.metrics.set_idle_connections(0);
            drained
        };
        self.clear_in_progress.store(false, Ordering::Release);

        info!(
            "Cleared connection pool for {} ({} idle connections closed)",
            self.connector.target(),
            drained.len()
        );
        self.metrics.record_evictions(drained.len());
        for mut entry in drained {
            entry.conn.close().await;
        }
        true
    }

    /// Stop the scavenger and close every idle connection
    ///
    /// Connections still checked out are closed instead of returned.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let scavenger = lock(&self.scavenger).take();
        if let Some(scavenger) = scavenger {
            let _ = scavenger.shutdown_tx.send(()).await;
            let _ = scavenger.handle.await;
        }

        let drained: Vec<PooledConnection> = {
            let mut idle = lock(&self.idle);
            let drained = idle.drain(..).collect();
            self.idle_count.store(0, Ordering::Relaxed);
            drained
        };
        for mut entry in drained {
            entry.conn.close().await;
        }
        self.blocks.clear();
        info!("Connection pool for {} shut down", self.connector.target());
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(scavenger) = self.scavenger.get_mut().ok().and_then(Option::take) {
            scavenger.handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A connection checked out of a [`ConnectionPool`]
///
/// Dropping the guard returns the connection to the pool when it is still
/// open and was acquired with pooling; otherwise the connection is closed.
pub struct ConnectionGuard<'a> {
    pool: &'a ConnectionPool,
    // Only empty while the guard is being dropped
    conn: Option<Box<dyn StoreConnection>>,
    pooled: bool,
}

impl ConnectionGuard<'_> {
    pub fn connection(&mut self) -> &mut dyn StoreConnection {
        self.conn
            .as_deref_mut()
            .expect("connection is held until the guard drops")
    }

    /// Whether the connection goes back to the pool on drop
    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    /// Replace a connection that reports itself closed
    pub async fn reconnect(&mut self, retry: &mut RetryState) -> Result<()> {
        let fresh = self.pool.connect(retry).await?;
        if let Some(mut stale) = self.conn.replace(fresh) {
            stale.close().await;
        }
        Ok(())
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.pooled);
        }
    }
}
