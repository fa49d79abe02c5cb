//! In-process backend used by the engine's unit tests
//!
//! Mirrors the stored-procedure semantics of the PostgreSQL backend: inserts
//! fail on a duplicate id, writes and releases are guarded by the lock cookie,
//! an exclusive read bumps the cookie, and chunk rows come back unordered.

use async_trait::async_trait;
use sqlsession_core::LockCookie;
use sqlsession_storage::{BlockPool, Chunk};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::connection::{CallReply, Connector, ItemReply, ProcedureCall, StoreConnection, WriteHeader};
use crate::db_error::{DbError, DbErrorKind, DbResult};

#[derive(Debug, Clone)]
pub struct Row {
    pub locked: bool,
    pub lock_cookie: i32,
    pub lock_date: Instant,
    pub initialized: bool,
    pub timeout_minutes: i32,
    pub item_size: i64,
    pub item: Option<Vec<u8>>,
    pub chunks: Vec<(i32, Vec<u8>)>,
    pub timeout_resets: usize,
}

#[derive(Default)]
pub struct MemoryBackend {
    rows: Mutex<HashMap<String, Row>>,
    call_failures: Mutex<VecDeque<DbError>>,
    connect_failures: Mutex<VecDeque<DbError>>,
    fail_forever: Mutex<Option<DbError>>,
    calls: Mutex<Vec<&'static str>>,
    connect_attempts: AtomicUsize,
    connects: AtomicUsize,
    closes: AtomicUsize,
    pk_violations: AtomicUsize,
    epoch: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next procedure call with `err`
    pub fn fail_next(&self, err: DbError) {
        self.call_failures.lock().unwrap().push_back(err);
    }

    /// Fail the next connect attempt with `err`
    pub fn fail_connect_next(&self, err: DbError) {
        self.connect_failures.lock().unwrap().push_back(err);
    }

    /// Fail every call and connect with `err` until cleared
    pub fn fail_forever(&self, err: Option<DbError>) {
        *self.fail_forever.lock().unwrap() = err;
    }

    /// Break every open connection
    pub fn kill_connections(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn pk_violations(&self) -> usize {
        self.pk_violations.load(Ordering::SeqCst)
    }

    /// Procedure names in call order
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    pub fn row(&self, id: &str) -> Option<Row> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn insert_row(&self, id: &str, row: Row) {
        self.rows.lock().unwrap().insert(id.to_string(), row);
    }

    fn run(&self, call: &ProcedureCall<'_>, blocks: &BlockPool) -> DbResult<CallReply> {
        self.calls.lock().unwrap().push(call.name());
        let mut rows = self.rows.lock().unwrap();

        match call {
            ProcedureCall::InsertOrUpdateItemSmall { header, item } => {
                let payload = Payload::Scalar(item.to_vec());
                self.write(&mut rows, header, payload)
            }
            ProcedureCall::InsertOrUpdateItemMedium { header, items } => {
                let chunks = items
                    .iter()
                    .flatten()
                    .zip(1..)
                    .map(|(block, sequence_id)| (sequence_id, block.to_vec()))
                    .collect();
                self.write(&mut rows, header, Payload::Chunked(chunks))
            }
            ProcedureCall::InsertOrUpdateItemLarge { header, items } => {
                let chunks = items
                    .iter()
                    .map(|record| (record.sequence_id, record.block.to_vec()))
                    .collect();
                self.write(&mut rows, header, Payload::Chunked(chunks))
            }
            ProcedureCall::GetItem {
                session_id,
                exclusive,
            } => {
                let Some(row) = rows.get_mut(*session_id) else {
                    return Ok(CallReply::NotFound);
                };

                if row.locked {
                    return Ok(CallReply::Item(ItemReply {
                        locked: true,
                        lock_age: row.lock_date.elapsed(),
                        lock_cookie: LockCookie(row.lock_cookie),
                        initialized: row.initialized,
                        ..ItemReply::default()
                    }));
                }

                if *exclusive {
                    row.lock_cookie += 1;
                    row.locked = true;
                    row.lock_date = Instant::now();
                }

                // Chunk rows come back in reverse to exercise reassembly ordering
                let chunks = row
                    .chunks
                    .iter()
                    .rev()
                    .map(|(sequence_id, bytes)| {
                        let mut block = blocks.acquire();
                        block.extend_from_slice(bytes);
                        Chunk {
                            sequence_id: *sequence_id,
                            block,
                        }
                    })
                    .collect();

                Ok(CallReply::Item(ItemReply {
                    locked: false,
                    lock_age: std::time::Duration::ZERO,
                    lock_cookie: LockCookie(row.lock_cookie),
                    initialized: row.initialized,
                    item_size: Some(row.item_size),
                    item: row.item.clone(),
                    chunks,
                }))
            }
            ProcedureCall::ReleaseItemExclusive {
                session_id,
                lock_cookie,
            } => {
                if let Some(row) = rows.get_mut(*session_id) {
                    if row.lock_cookie == lock_cookie.value() {
                        row.locked = false;
                    }
                }
                Ok(CallReply::Done)
            }
            ProcedureCall::RemoveItem {
                session_id,
                lock_cookie,
            } => {
                if rows
                    .get(*session_id)
                    .is_some_and(|row| row.lock_cookie == lock_cookie.value())
                {
                    rows.remove(*session_id);
                }
                Ok(CallReply::Done)
            }
            ProcedureCall::ResetItemTimeout { session_id } => {
                if let Some(row) = rows.get_mut(*session_id) {
                    row.timeout_resets += 1;
                }
                Ok(CallReply::Done)
            }
        }
    }

    fn write(
        &self,
        rows: &mut HashMap<String, Row>,
        header: &WriteHeader<'_>,
        payload: Payload,
    ) -> DbResult<CallReply> {
        let (item, chunks) = match payload {
            Payload::Scalar(item) => (Some(item), Vec::new()),
            Payload::Chunked(chunks) => (None, chunks),
        };

        if header.new_item {
            if rows.contains_key(header.session_id) {
                self.pk_violations.fetch_add(1, Ordering::SeqCst);
                return Err(DbError::new(
                    DbErrorKind::PrimaryKeyViolation,
                    "duplicate key value violates unique constraint \"session_state_pkey\"",
                )
                .with_code("23505"));
            }
            rows.insert(
                header.session_id.to_string(),
                Row {
                    locked: false,
                    lock_cookie: 1,
                    lock_date: Instant::now(),
                    initialized: header.initialized,
                    timeout_minutes: header.timeout_minutes,
                    item_size: header.item_size,
                    item,
                    chunks,
                    timeout_resets: 0,
                },
            );
            return Ok(CallReply::Done);
        }

        if let Some(row) = rows.get_mut(header.session_id) {
            if row.lock_cookie == header.lock_cookie.value() {
                row.locked = false;
                row.initialized = header.initialized;
                row.timeout_minutes = header.timeout_minutes;
                row.item_size = header.item_size;
                row.item = item;
                row.chunks = chunks;
            }
        }
        Ok(CallReply::Done)
    }
}

enum Payload {
    Scalar(Vec<u8>),
    Chunked(Vec<(i32, Vec<u8>)>),
}

pub struct MemoryConnector {
    backend: Arc<MemoryBackend>,
    integrated_security: bool,
}

impl MemoryConnector {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self {
            backend,
            integrated_security: false,
        }
    }

    pub fn with_integrated_security(mut self) -> Self {
        self.integrated_security = true;
        self
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> DbResult<Box<dyn StoreConnection>> {
        self.backend.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.backend.connect_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = self.backend.fail_forever.lock().unwrap().clone() {
            return Err(err);
        }

        self.backend.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            backend: self.backend.clone(),
            epoch: self.backend.epoch.load(Ordering::SeqCst),
            open: true,
        }))
    }

    fn target(&self) -> &str {
        "memory"
    }

    fn uses_integrated_security(&self) -> bool {
        self.integrated_security
    }
}

pub struct MemoryConnection {
    backend: Arc<MemoryBackend>,
    epoch: u64,
    open: bool,
}

#[async_trait]
impl StoreConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open && self.epoch == self.backend.epoch.load(Ordering::SeqCst)
    }

    async fn execute(&mut self, call: &ProcedureCall<'_>, blocks: &BlockPool) -> DbResult<CallReply> {
        if !self.is_open() {
            self.open = false;
            return Err(DbError::new(DbErrorKind::Severe, "connection is closed"));
        }

        let injected = self
            .backend
            .call_failures
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.backend.fail_forever.lock().unwrap().clone());
        if let Some(err) = injected {
            if err.breaks_connection() {
                self.open = false;
            }
            return Err(err);
        }

        self.backend.run(call, blocks)
    }

    async fn close(&mut self) {
        if self.open {
            self.open = false;
            self.backend.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}
