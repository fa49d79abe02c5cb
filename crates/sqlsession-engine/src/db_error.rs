//! Backing-store error taxonomy
//!
//! Backends translate their native errors into a [`DbError`] so the retry
//! engine can classify failures without knowing which database produced them.

use std::fmt;
use thiserror::Error;

/// Coarse category of a backing-store failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// Login rejected (bad credentials or invalid authorization)
    AuthenticationFailed,
    /// The target database cannot be opened for this login
    CannotOpenDatabase,
    /// Concurrent-update, commit-dependency or repeatable-read validation failure
    SnapshotConflict,
    /// Duplicate key on insert
    PrimaryKeyViolation,
    /// Statement or connect timeout
    Timeout,
    /// Severe server error or broken transport; the connection is likely gone
    Severe,
    /// Anything else (bad SQL, constraint failures, decode errors)
    Other,
}

impl DbErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbErrorKind::AuthenticationFailed => "authentication_failed",
            DbErrorKind::CannotOpenDatabase => "cannot_open_database",
            DbErrorKind::SnapshotConflict => "snapshot_conflict",
            DbErrorKind::PrimaryKeyViolation => "primary_key_violation",
            DbErrorKind::Timeout => "timeout",
            DbErrorKind::Severe => "severe",
            DbErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified backing-store failure
#[derive(Debug, Clone, Error)]
#[error("{kind} error{}: {message}", code.as_ref().map(|c| format!(" [{}]", c)).unwrap_or_default())]
pub struct DbError {
    pub kind: DbErrorKind,
    /// Backend-native error code (SQLSTATE for PostgreSQL)
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Whether the connection that produced this error should be considered dead
    pub fn breaks_connection(&self) -> bool {
        matches!(self.kind, DbErrorKind::Severe)
    }
}

pub type DbResult<T> = Result<T, DbError>;
