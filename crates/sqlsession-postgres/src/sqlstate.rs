//! Translation of sqlx/PostgreSQL errors into the engine's error taxonomy

use sqlsession_engine::{DbError, DbErrorKind};

/// Classify a SQLSTATE code
pub fn kind_for_sqlstate(code: &str) -> DbErrorKind {
    match code {
        // invalid_password, invalid_authorization_specification
        "28P01" | "28000" => DbErrorKind::AuthenticationFailed,
        // invalid_catalog_name
        "3D000" => DbErrorKind::CannotOpenDatabase,
        // serialization_failure, deadlock_detected
        "40001" | "40P01" => DbErrorKind::SnapshotConflict,
        // unique_violation
        "23505" => DbErrorKind::PrimaryKeyViolation,
        // query_canceled (statement_timeout)
        "57014" => DbErrorKind::Timeout,
        // connection exception, insufficient resources, operator intervention
        // (admin/crash shutdown), system error, internal error
        c if c.starts_with("08")
            || c.starts_with("53")
            || c.starts_with("57P")
            || c.starts_with("58")
            || c.starts_with("XX") =>
        {
            DbErrorKind::Severe
        }
        _ => DbErrorKind::Other,
    }
}

/// Convert a sqlx error into a [`DbError`]
pub fn map_sqlx_error(err: sqlx::Error) -> DbError {
    match &err {
        sqlx::Error::Database(db) => {
            let kind = db
                .code()
                .map(|code| kind_for_sqlstate(&code))
                .unwrap_or(DbErrorKind::Other);
            let error = DbError::new(kind, db.message());
            match db.code() {
                Some(code) => error.with_code(code.into_owned()),
                None => error,
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DbError::new(DbErrorKind::Severe, err.to_string()),
        sqlx::Error::PoolTimedOut => DbError::new(DbErrorKind::Timeout, err.to_string()),
        _ => DbError::new(DbErrorKind::Other, err.to_string()),
    }
}
