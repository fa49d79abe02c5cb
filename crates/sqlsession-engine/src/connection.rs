//! Backend seam: stored-procedure calls and the connections that run them
//!
//! The engine speaks to the backing store only in terms of [`ProcedureCall`]s.
//! A backend implements [`Connector`] to open connections and
//! [`StoreConnection`] to execute calls on one of them.

use async_trait::async_trait;
use sqlsession_core::LockCookie;
use sqlsession_storage::{BlockPool, BlockRecord, Chunk, ITEM_BLOCK_MAX_PARAMS};
use std::time::Duration;

use crate::db_error::DbResult;

/// Columns shared by the three insert-or-update procedures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteHeader<'a> {
    pub session_id: &'a str,
    /// Insert a new row instead of updating the locked one
    pub new_item: bool,
    /// `false` only for placeholders created by `create_uninitialized_item`
    pub initialized: bool,
    pub lock_cookie: LockCookie,
    pub timeout_minutes: i32,
    /// Total encoded payload length
    pub item_size: i64,
}

/// One stored-procedure invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcedureCall<'a> {
    InsertOrUpdateItemSmall {
        header: WriteHeader<'a>,
        item: &'a [u8],
    },
    InsertOrUpdateItemMedium {
        header: WriteHeader<'a>,
        items: [Option<&'a [u8]>; ITEM_BLOCK_MAX_PARAMS],
    },
    InsertOrUpdateItemLarge {
        header: WriteHeader<'a>,
        items: Vec<BlockRecord<'a>>,
    },
    GetItem {
        session_id: &'a str,
        exclusive: bool,
    },
    ReleaseItemExclusive {
        session_id: &'a str,
        lock_cookie: LockCookie,
    },
    RemoveItem {
        session_id: &'a str,
        lock_cookie: LockCookie,
    },
    ResetItemTimeout {
        session_id: &'a str,
    },
}

impl<'a> ProcedureCall<'a> {
    /// Name of the procedure, used for logging and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            ProcedureCall::InsertOrUpdateItemSmall { .. } => "insert_or_update_state_item",
            ProcedureCall::InsertOrUpdateItemMedium { .. } => "insert_or_update_state_item_medium",
            ProcedureCall::InsertOrUpdateItemLarge { .. } => "insert_or_update_state_item_large",
            ProcedureCall::GetItem {
                exclusive: false, ..
            } => "get_state_item",
            ProcedureCall::GetItem {
                exclusive: true, ..
            } => "get_state_item_exclusive",
            ProcedureCall::ReleaseItemExclusive { .. } => "release_state_item_exclusive",
            ProcedureCall::RemoveItem { .. } => "remove_state_item",
            ProcedureCall::ResetItemTimeout { .. } => "reset_state_item_timeout",
        }
    }

    pub fn session_id(&self) -> &'a str {
        match self {
            ProcedureCall::InsertOrUpdateItemSmall { header, .. }
            | ProcedureCall::InsertOrUpdateItemMedium { header, .. }
            | ProcedureCall::InsertOrUpdateItemLarge { header, .. } => header.session_id,
            ProcedureCall::GetItem { session_id, .. }
            | ProcedureCall::ReleaseItemExclusive { session_id, .. }
            | ProcedureCall::RemoveItem { session_id, .. }
            | ProcedureCall::ResetItemTimeout { session_id } => session_id,
        }
    }

    /// Whether this call inserts a brand-new row
    pub fn is_insert(&self) -> bool {
        match self {
            ProcedureCall::InsertOrUpdateItemSmall { header, .. }
            | ProcedureCall::InsertOrUpdateItemMedium { header, .. }
            | ProcedureCall::InsertOrUpdateItemLarge { header, .. } => header.new_item,
            _ => false,
        }
    }
}

/// Result of a get procedure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemReply {
    pub locked: bool,
    pub lock_age: Duration,
    pub lock_cookie: LockCookie,
    pub initialized: bool,
    /// Total payload length when the payload was stored in chunks
    pub item_size: Option<i64>,
    /// Scalar payload for small-tier rows
    pub item: Option<Vec<u8>>,
    /// Unordered chunk rows for medium and large-tier rows, backed by pooled blocks
    pub chunks: Vec<Chunk>,
}

/// Result of one procedure call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallReply {
    /// The call completed; nothing to return
    Done,
    /// An insert found the row already present
    AlreadyExists,
    /// A get found a row (locked or not)
    Item(ItemReply),
    /// A get found no row
    NotFound,
}

/// An open connection to the backing store
#[async_trait]
pub trait StoreConnection: Send {
    /// Whether the connection can still run calls
    fn is_open(&self) -> bool;

    /// Execute one procedure call
    ///
    /// Chunk blocks of an [`ItemReply`] are taken from `blocks`; the caller
    /// returns them once reassembled.
    async fn execute(&mut self, call: &ProcedureCall<'_>, blocks: &BlockPool) -> DbResult<CallReply>;

    /// Close the connection; further calls are undefined
    async fn close(&mut self);
}

/// Factory of [`StoreConnection`]s for one target database
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> DbResult<Box<dyn StoreConnection>>;

    /// Printable target, without credentials
    fn target(&self) -> &str;

    /// Integrated-security logins are never pooled
    fn uses_integrated_security(&self) -> bool;
}
