//! Session identifier limits

use crate::{Error, Result};

/// Maximum number of characters accepted in a session id
pub const SESSION_ID_LENGTH_LIMIT: usize = 80;

/// Characters reserved after the id for an application suffix (partitioning)
pub const APP_SUFFIX_LENGTH: usize = 8;

/// Width of the session id column in the backing store
pub const SESSION_ID_COLUMN_LENGTH: usize = SESSION_ID_LENGTH_LIMIT + APP_SUFFIX_LENGTH;

/// Reject ids longer than [`SESSION_ID_LENGTH_LIMIT`] before any network call.
pub fn validate_session_id(id: &str) -> Result<()> {
    let length = id.chars().count();
    if length > SESSION_ID_LENGTH_LIMIT {
        return Err(Error::SessionIdTooLong {
            length,
            limit: SESSION_ID_LENGTH_LIMIT,
        });
    }
    Ok(())
}
