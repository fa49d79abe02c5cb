//! Error types for sqlsession Core

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced to callers of a session-state store.
///
/// `StoreUnavailable` and `InvalidSessionState` are deliberately distinct:
/// the first means "retry later", the second means "treat the session as lost".
#[derive(Debug, Error)]
pub enum Error {
    #[error("Session state store unavailable: {message}")]
    StoreUnavailable {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid session state: {0}")]
    InvalidSessionState(String),

    #[error("Session id too long: {length} characters exceeds the limit of {limit}")]
    SessionIdTooLong { length: usize, limit: usize },

    #[error("Session payload too large: {size} bytes exceeds the limit of {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a `StoreUnavailable` error without an underlying cause
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Build a `StoreUnavailable` error wrapping the backing-store failure
    pub fn store_unavailable_with<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::StoreUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// The backing store could not be reached; the caller may retry later.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// The stored payload is unreadable; the caller should treat the session as lost.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, Self::InvalidSessionState(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
