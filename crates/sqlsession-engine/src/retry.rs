//! Retry/backoff engine
//!
//! A small state machine: every failed attempt is classified, then either
//! retried after a backoff, reported as a benign race, or surfaced. Cumulative
//! backoff is capped; once the cap is reached the last error is surfaced as
//! `StoreUnavailable`.

use sqlsession_core::Error;
use std::time::Duration;

use crate::db_error::{DbError, DbErrorKind};

/// Backoff durations and ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Backoff after a snapshot/write conflict
    pub conflict_backoff: Duration,
    /// Backoff after the first severe error or timeout of a call
    pub first_severe_backoff: Duration,
    /// Backoff after each further severe error or timeout
    pub severe_backoff: Duration,
    /// Stop retrying once cumulative backoff reaches this
    pub max_total_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            conflict_backoff: Duration::from_millis(100),
            first_severe_backoff: Duration::from_secs(3),
            severe_backoff: Duration::from_secs(1),
            max_total_backoff: Duration::from_secs(120),
        }
    }
}

/// How a failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Login or database-open failure; never retried
    Fatal,
    /// Snapshot/write conflict; short backoff
    Conflict,
    /// Severe error or timeout; the connection is suspect
    Severe,
    /// Insert lost a race to a concurrent insert of the same id
    Benign,
    /// Anything else; surfaced immediately
    NotRetryable,
}

/// Classify a backing-store failure
///
/// `allow_insert_race` is set only for insert paths where a duplicate key
/// means a concurrent caller created the same row.
pub fn classify(err: &DbError, allow_insert_race: bool) -> Classification {
    match err.kind {
        DbErrorKind::AuthenticationFailed | DbErrorKind::CannotOpenDatabase => {
            Classification::Fatal
        }
        DbErrorKind::SnapshotConflict => Classification::Conflict,
        DbErrorKind::Severe | DbErrorKind::Timeout => Classification::Severe,
        DbErrorKind::PrimaryKeyViolation if allow_insert_race => Classification::Benign,
        DbErrorKind::PrimaryKeyViolation | DbErrorKind::Other => Classification::NotRetryable,
    }
}

/// What to do after a failed attempt
#[derive(Debug)]
pub enum Decision {
    Retry {
        delay: Duration,
        /// Dispose every pooled connection before retrying
        clear_pool: bool,
        /// Metrics label: `short`, `medium` or `long`
        kind: &'static str,
    },
    Benign,
    Fail(Error),
}

/// Per-call retry bookkeeping
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    total_backoff: Duration,
    severe_seen: bool,
    attempts: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            total_backoff: Duration::ZERO,
            severe_seen: false,
            attempts: 0,
        }
    }

    /// Number of failed attempts seen so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Cumulative backoff handed out so far
    pub fn total_backoff(&self) -> Duration {
        self.total_backoff
    }

    /// Record a failed attempt and decide the next step
    pub fn on_failure(&mut self, err: DbError, allow_insert_race: bool) -> Decision {
        self.attempts += 1;

        let (delay, clear_pool, kind) = match classify(&err, allow_insert_race) {
            Classification::Benign => return Decision::Benign,
            Classification::Fatal => {
                return Decision::Fail(Error::store_unavailable_with(
                    "login to the session state database failed",
                    err,
                ));
            }
            Classification::NotRetryable => {
                return Decision::Fail(Error::store_unavailable_with(
                    "session state call failed",
                    err,
                ));
            }
            Classification::Conflict => (self.policy.conflict_backoff, false, "short"),
            Classification::Severe if !self.severe_seen => {
                self.severe_seen = true;
                (self.policy.first_severe_backoff, true, "long")
            }
            Classification::Severe => (self.policy.severe_backoff, false, "medium"),
        };

        if self.total_backoff >= self.policy.max_total_backoff {
            return Decision::Fail(Error::store_unavailable_with(
                format!(
                    "session state database unavailable after {} attempts and {:?} of backoff",
                    self.attempts, self.total_backoff
                ),
                err,
            ));
        }

        // Never sleep past the ceiling
        let delay = delay.min(self.policy.max_total_backoff - self.total_backoff);
        self.total_backoff += delay;
        Decision::Retry {
            delay,
            clear_pool,
            kind,
        }
    }
}
