//! Session-state store trait consumed by the hosting web layer
//!
//! The `SessionStateStore` trait describes the per-request contract between a
//! web framework's session module and the backing store. Implementations must
//! be safe under concurrent calls, including concurrent calls for the same id;
//! the lock cookie is the only ordering primitive between them.

use async_trait::async_trait;

use crate::{LockCookie, Result, SessionLookup, SessionRecord};

/// Session-state store trait
///
/// Lifecycle of one session id:
/// `Absent -> Uninitialized -> Locked(cookie) -> Unlocked`, ending when the row
/// is removed or expires in the backing store.
///
/// # Example
/// ```no_run
/// # use sqlsession_core::{SessionStateStore, Result};
/// # async fn example(store: &dyn SessionStateStore) -> Result<()> {
/// let lookup = store.get_item_exclusive("abc").await?;
/// if lookup.locked {
///     // Somebody else is writing; poll again later
///     return Ok(());
/// }
///
/// let mut record = lookup
///     .record
///     .unwrap_or_else(|| store.create_new_store_data(20));
/// record.items.insert("visits", serde_json::json!(1));
///
/// let is_new = lookup.lock_cookie.value() == 0 && !lookup.requires_initialization;
/// store
///     .set_and_release_item_exclusive("abc", &record, lookup.lock_cookie, is_new)
///     .await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    /// Create a fresh in-memory record; performs no I/O
    fn create_new_store_data(&self, timeout_minutes: i32) -> SessionRecord {
        SessionRecord::new(timeout_minutes)
    }

    /// Store a placeholder record that still requires initialization
    ///
    /// Two callers racing to create the same id both succeed; only one row is
    /// written.
    async fn create_uninitialized_item(&self, id: &str, timeout_minutes: i32) -> Result<()>;

    /// Read without taking the exclusive lock
    async fn get_item(&self, id: &str) -> Result<SessionLookup>;

    /// Read and take the exclusive lock
    ///
    /// When another caller already holds the lock the lookup reports
    /// `locked = true` and carries no record; the caller decides whether to poll.
    async fn get_item_exclusive(&self, id: &str) -> Result<SessionLookup>;

    /// Write `record` and release the lock held under `lock_cookie`
    ///
    /// # Errors
    /// - `Error::PayloadTooLarge` if the record cannot be encoded; the lock is
    ///   released first unless `new_item` is set
    /// - `Error::SessionIdTooLong` for ids over the limit
    /// - `Error::StoreUnavailable` when the backing store cannot be reached
    async fn set_and_release_item_exclusive(
        &self,
        id: &str,
        record: &SessionRecord,
        lock_cookie: LockCookie,
        new_item: bool,
    ) -> Result<()>;

    /// Release the lock without writing
    async fn release_item_exclusive(&self, id: &str, lock_cookie: LockCookie) -> Result<()>;

    /// Delete the record; a stale cookie makes this a no-op
    async fn remove_item(&self, id: &str, lock_cookie: LockCookie) -> Result<()>;

    /// Refresh the expiry without touching payload or lock state
    async fn reset_item_timeout(&self, id: &str) -> Result<()>;
}
