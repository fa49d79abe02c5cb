//! Chunked transport
//!
//! Turns encoded payloads into procedure calls of the right tier, runs every
//! call inside the retry engine and reassembles chunked reads.

use sqlsession_core::{Error, LockCookie, Result, validate_session_id};
use sqlsession_storage::{PayloadTier, large_records, medium_parameters, reassemble};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::connection::{CallReply, ItemReply, ProcedureCall, WriteHeader};
use crate::pool::ConnectionPool;
use crate::retry::{Decision, RetryState};

/// Result of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// An insert found the row already created by a concurrent caller
    AlreadyExists,
}

/// One payload write
#[derive(Debug, Clone, Copy)]
pub struct WriteRequest<'a> {
    pub session_id: &'a str,
    pub timeout_minutes: i32,
    pub lock_cookie: LockCookie,
    pub new_item: bool,
    pub initialized: bool,
    pub payload: &'a [u8],
}

/// Result of a read for a stored row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemRead {
    /// Encoded payload; `None` when the row is locked by another caller
    pub buffer: Option<Vec<u8>>,
    pub locked: bool,
    pub lock_age: Duration,
    pub lock_cookie: LockCookie,
    pub requires_initialization: bool,
}

pub struct ChunkedTransport {
    pool: Arc<ConnectionPool>,
    allow_pooling: bool,
}

impl ChunkedTransport {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            allow_pooling: true,
        }
    }

    /// Never return connections to the pool after a call
    pub fn without_pooling(mut self) -> Self {
        self.allow_pooling = false;
        self
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Write a payload, picking the tier from its length
    ///
    /// A duplicate key on an insert (`new_item`) means another caller created
    /// the row first and is reported as [`WriteOutcome::AlreadyExists`].
    pub async fn write(&self, request: &WriteRequest<'_>) -> Result<WriteOutcome> {
        validate_session_id(request.session_id)?;

        let payload = request.payload;
        let tier = PayloadTier::for_length(payload.len());
        let header = WriteHeader {
            session_id: request.session_id,
            new_item: request.new_item,
            initialized: request.initialized,
            lock_cookie: request.lock_cookie,
            timeout_minutes: request.timeout_minutes,
            item_size: payload.len() as i64,
        };

        let call = match tier {
            PayloadTier::Small => ProcedureCall::InsertOrUpdateItemSmall {
                header,
                item: payload,
            },
            PayloadTier::Medium => ProcedureCall::InsertOrUpdateItemMedium {
                header,
                items: medium_parameters(payload)?,
            },
            PayloadTier::Large => ProcedureCall::InsertOrUpdateItemLarge {
                header,
                items: large_records(payload),
            },
        };

        debug!(
            session_id = request.session_id,
            tier = tier.as_str(),
            length = payload.len(),
            new_item = request.new_item,
            "Writing session state"
        );

        match self.execute(&call, request.new_item).await? {
            CallReply::AlreadyExists => Ok(WriteOutcome::AlreadyExists),
            _ => Ok(WriteOutcome::Written),
        }
    }

    /// Read a row; `None` when no row exists
    pub async fn read(&self, session_id: &str, exclusive: bool) -> Result<Option<ItemRead>> {
        validate_session_id(session_id)?;

        let call = ProcedureCall::GetItem {
            session_id,
            exclusive,
        };
        let reply = match self.execute(&call, false).await? {
            CallReply::Item(reply) => reply,
            CallReply::NotFound => return Ok(None),
            other => {
                return Err(Error::store_unavailable(format!(
                    "unexpected reply to {}: {:?}",
                    call.name(),
                    other
                )));
            }
        };

        let ItemReply {
            locked,
            lock_age,
            lock_cookie,
            initialized,
            item_size,
            item,
            chunks,
        } = reply;

        let buffer = if locked {
            for chunk in chunks {
                self.pool.blocks().release(chunk.block);
            }
            None
        } else if let Some(item) = item {
            for chunk in chunks {
                self.pool.blocks().release(chunk.block);
            }
            Some(item)
        } else if !chunks.is_empty() {
            Some(reassemble(chunks, self.pool.blocks())?)
        } else if item_size.is_some_and(|size| size > 0) {
            return Err(Error::InvalidSessionState(format!(
                "{} has no stored blocks for a {} byte payload",
                session_id,
                item_size.unwrap_or_default()
            )));
        } else {
            None
        };

        if let (Some(buffer), Some(expected)) = (&buffer, item_size) {
            if buffer.len() as i64 != expected {
                return Err(Error::InvalidSessionState(format!(
                    "stored payload is {} bytes but {} were recorded",
                    buffer.len(),
                    expected
                )));
            }
        }

        Ok(Some(ItemRead {
            buffer,
            locked,
            lock_age,
            lock_cookie,
            requires_initialization: !initialized,
        }))
    }

    /// Release the exclusive lock held under `lock_cookie`
    pub async fn release_exclusive(&self, session_id: &str, lock_cookie: LockCookie) -> Result<()> {
        validate_session_id(session_id)?;
        let call = ProcedureCall::ReleaseItemExclusive {
            session_id,
            lock_cookie,
        };
        self.execute(&call, false).await.map(drop)
    }

    /// Delete the row if `lock_cookie` still matches
    pub async fn remove(&self, session_id: &str, lock_cookie: LockCookie) -> Result<()> {
        validate_session_id(session_id)?;
        let call = ProcedureCall::RemoveItem {
            session_id,
            lock_cookie,
        };
        self.execute(&call, false).await.map(drop)
    }

    /// Push the row's expiry out by its timeout
    pub async fn reset_timeout(&self, session_id: &str) -> Result<()> {
        validate_session_id(session_id)?;
        let call = ProcedureCall::ResetItemTimeout { session_id };
        self.execute(&call, false).await.map(drop)
    }

    async fn execute(&self, call: &ProcedureCall<'_>, allow_insert_race: bool) -> Result<CallReply> {
        let started = Instant::now();
        let result = self.execute_with_retry(call, allow_insert_race).await;

        let outcome = match &result {
            Ok(CallReply::AlreadyExists) => "already_exists",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        self.pool
            .metrics()
            .record_call(call.name(), outcome, started.elapsed());
        result
    }

    async fn execute_with_retry(
        &self,
        call: &ProcedureCall<'_>,
        allow_insert_race: bool,
    ) -> Result<CallReply> {
        let mut retry = RetryState::new(self.pool.retry_policy());
        let mut guard = self
            .pool
            .acquire_with_retry(self.allow_pooling, &mut retry)
            .await?;

        loop {
            if !guard.connection().is_open() {
                guard.reconnect(&mut retry).await?;
            }

            let err = match guard.connection().execute(call, self.pool.blocks()).await {
                Ok(reply) => return Ok(reply),
                Err(err) => err,
            };

            let message = err.to_string();
            match retry.on_failure(err, allow_insert_race) {
                Decision::Benign => {
                    debug!(
                        session_id = call.session_id(),
                        procedure = call.name(),
                        "Insert raced with a concurrent insert"
                    );
                    self.pool.metrics().record_benign_race();
                    return Ok(CallReply::AlreadyExists);
                }
                Decision::Retry {
                    delay,
                    clear_pool,
                    kind,
                } => {
                    warn!(
                        session_id = call.session_id(),
                        procedure = call.name(),
                        backoff_ms = delay.as_millis() as u64,
                        attempt = retry.attempts(),
                        "Retrying session state call: {}",
                        message
                    );
                    if clear_pool {
                        self.pool.clear().await;
                    }
                    self.pool.metrics().record_backoff(kind);
                    tokio::time::sleep(delay).await;
                }
                Decision::Fail(e) => {
                    error!(
                        session_id = call.session_id(),
                        procedure = call.name(),
                        attempts = retry.attempts(),
                        "Session state call failed: {}",
                        message
                    );
                    return Err(e);
                }
            }
        }
    }
}
