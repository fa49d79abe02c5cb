//! Session-state store facade
//!
//! Implements [`SessionStateStore`] on top of the payload codec and the
//! chunked transport. Nothing is cached between calls; every read goes to
//! the backing store.

use async_trait::async_trait;
use sqlsession_core::{
    Error, LockCookie, Result, SessionLookup, SessionRecord, SessionStateStore,
};
use sqlsession_storage::PayloadCodec;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::connection::Connector;
use crate::metrics::StoreMetrics;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::retry::RetryPolicy;
use crate::transport::{ChunkedTransport, WriteOutcome, WriteRequest};

/// Relational session-state store
pub struct SqlSessionStateStore {
    codec: PayloadCodec,
    transport: ChunkedTransport,
}

impl SqlSessionStateStore {
    /// Create a store over `connector`, starting the pool's scavenger
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(connector: Arc<dyn Connector>, config: &StoreConfig) -> Result<Self> {
        config.validate()?;

        let metrics = StoreMetrics::new()
            .map_err(|e| Error::Config(format!("cannot register store metrics: {}", e)))?;
        let pool = ConnectionPool::open(
            connector,
            PoolOptions::from(&config.pool),
            RetryPolicy::from(&config.retry),
            metrics,
        );
        let codec = PayloadCodec::new(config.compression_enabled)
            .with_max_payload_bytes(config.max_payload_bytes);

        Ok(Self::with_pool(pool, codec))
    }

    /// Create a store over an existing pool
    pub fn with_pool(pool: Arc<ConnectionPool>, codec: PayloadCodec) -> Self {
        Self {
            codec,
            transport: ChunkedTransport::new(pool),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.transport.pool()
    }

    pub fn metrics(&self) -> &StoreMetrics {
        self.transport.pool().metrics()
    }

    /// Stop the scavenger and close idle connections
    pub async fn shutdown(&self) {
        self.transport.pool().shutdown().await;
    }

    async fn lookup(&self, id: &str, exclusive: bool) -> Result<SessionLookup> {
        let Some(read) = self.transport.read(id, exclusive).await? else {
            return Ok(SessionLookup::absent());
        };

        let record = match read.buffer {
            Some(buffer) if !read.locked => match self.codec.decode(&buffer) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(session_id = id, "Stored session state is unreadable: {}", e);
                    return Err(e);
                }
            },
            _ => None,
        };

        Ok(SessionLookup {
            record,
            locked: read.locked,
            lock_age: read.lock_age,
            lock_cookie: read.lock_cookie,
            requires_initialization: read.requires_initialization,
        })
    }
}

#[async_trait]
impl SessionStateStore for SqlSessionStateStore {
    async fn create_uninitialized_item(&self, id: &str, timeout_minutes: i32) -> Result<()> {
        let record = self.create_new_store_data(timeout_minutes);
        let payload = self.codec.encode(&record)?;

        let outcome = self
            .transport
            .write(&WriteRequest {
                session_id: id,
                timeout_minutes,
                lock_cookie: LockCookie::default(),
                new_item: true,
                initialized: false,
                payload: payload.as_slice(),
            })
            .await?;

        if outcome == WriteOutcome::AlreadyExists {
            debug!(
                session_id = id,
                "Uninitialized session already created by a concurrent request"
            );
        }
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<SessionLookup> {
        self.lookup(id, false).await
    }

    async fn get_item_exclusive(&self, id: &str) -> Result<SessionLookup> {
        self.lookup(id, true).await
    }

    async fn set_and_release_item_exclusive(
        &self,
        id: &str,
        record: &SessionRecord,
        lock_cookie: LockCookie,
        new_item: bool,
    ) -> Result<()> {
        let payload = match self.codec.encode(record) {
            Ok(payload) => payload,
            Err(err) => {
                // Never leave the row locked behind a failed write
                if !new_item {
                    if let Err(release_err) =
                        self.transport.release_exclusive(id, lock_cookie).await
                    {
                        warn!(
                            session_id = id,
                            "Cannot release lock after failed encode: {}", release_err
                        );
                    }
                }
                return Err(err);
            }
        };

        let outcome = self
            .transport
            .write(&WriteRequest {
                session_id: id,
                timeout_minutes: record.timeout_minutes,
                lock_cookie,
                new_item,
                initialized: true,
                payload: payload.as_slice(),
            })
            .await?;

        if outcome == WriteOutcome::AlreadyExists {
            debug!(session_id = id, "New session already created by a concurrent request");
        }
        Ok(())
    }

    async fn release_item_exclusive(&self, id: &str, lock_cookie: LockCookie) -> Result<()> {
        self.transport.release_exclusive(id, lock_cookie).await
    }

    async fn remove_item(&self, id: &str, lock_cookie: LockCookie) -> Result<()> {
        self.transport.remove(id, lock_cookie).await
    }

    async fn reset_item_timeout(&self, id: &str) -> Result<()> {
        self.transport.reset_timeout(id).await
    }
}

#[cfg(test)]
mod tests;
