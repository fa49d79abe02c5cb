//! sqlsession Core Types and Traits
//!
//! This crate provides the fundamental types and traits shared by every layer
//! of the session-state store:
//! - Session records, item collections and lock metadata
//! - The `SessionStateStore` trait consumed by hosting web layers
//! - Core error types

pub mod error;
pub mod record;
pub mod session_id;
pub mod session_store;

pub use error::{Error, Result};
pub use record::{
    LockCookie, SessionAction, SessionItems, SessionLookup, SessionRecord, StaticObjects,
};
pub use session_id::{
    APP_SUFFIX_LENGTH, SESSION_ID_COLUMN_LENGTH, SESSION_ID_LENGTH_LIMIT, validate_session_id,
};
pub use session_store::SessionStateStore;
