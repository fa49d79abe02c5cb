//! Database migration system for the PostgreSQL session-state store
//!
//! Provides versioned schema migrations with tracking to ensure migrations
//! are applied exactly once and in the correct order. Concurrent installers
//! are serialized with an advisory lock.

use sqlsession_core::{Error, Result};
use sqlx::PgConnection;
use tracing::{debug, info, warn};

use crate::sqlstate::map_sqlx_error;

/// Advisory lock key held while migrations run
const MIGRATION_LOCK_KEY: i64 = 0x5345_5353_494f_4e53;

/// Represents a single database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Unique version number (must be sequential)
    pub version: i32,
    /// Description of what this migration does
    pub description: &'static str,
    /// SQL to execute for this migration
    pub up_sql: &'static str,
}

/// All migrations in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Create session state tables",
        up_sql: r#"
            CREATE TABLE IF NOT EXISTS session_state (
                session_id VARCHAR(88) PRIMARY KEY,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                expires_at TIMESTAMPTZ NOT NULL,

                -- Exclusive lock
                lock_date TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                lock_cookie INTEGER NOT NULL DEFAULT 1,
                locked BOOLEAN NOT NULL DEFAULT FALSE,

                timeout_minutes INTEGER NOT NULL,
                initialized BOOLEAN NOT NULL DEFAULT FALSE,

                -- Payload; item is NULL when stored as blocks
                item_size BIGINT,
                item BYTEA
            );

            CREATE INDEX IF NOT EXISTS idx_session_state_expires_at
            ON session_state(expires_at);

            CREATE TABLE IF NOT EXISTS session_state_items (
                session_id VARCHAR(88) NOT NULL
                    REFERENCES session_state(session_id) ON DELETE CASCADE,
                session_item_id INTEGER NOT NULL,
                item BYTEA NOT NULL,

                PRIMARY KEY (session_id, session_item_id)
            )
        "#,
    },
    Migration {
        version: 2,
        description: "Create session state write procedures",
        up_sql: r#"
            CREATE OR REPLACE FUNCTION write_state_header(
                p_session_id TEXT,
                p_new_item BOOLEAN,
                p_initialized BOOLEAN,
                p_lock_cookie INTEGER,
                p_timeout_minutes INTEGER,
                p_item_size BIGINT,
                p_item BYTEA
            ) RETURNS BOOLEAN
            LANGUAGE plpgsql AS $$
            BEGIN
                IF p_new_item THEN
                    -- An expired row no longer owns the id
                    DELETE FROM session_state
                    WHERE session_id = p_session_id AND expires_at <= NOW();

                    INSERT INTO session_state (
                        session_id, expires_at, lock_date, lock_cookie, locked,
                        timeout_minutes, initialized, item_size, item
                    ) VALUES (
                        p_session_id, NOW() + make_interval(mins => p_timeout_minutes), NOW(), 1, FALSE,
                        p_timeout_minutes, p_initialized, p_item_size, p_item
                    );
                    RETURN TRUE;
                END IF;

                UPDATE session_state
                SET expires_at = NOW() + make_interval(mins => p_timeout_minutes),
                    timeout_minutes = p_timeout_minutes,
                    locked = FALSE,
                    initialized = p_initialized,
                    item_size = p_item_size,
                    item = p_item
                WHERE session_id = p_session_id AND lock_cookie = p_lock_cookie;

                IF NOT FOUND THEN
                    RETURN FALSE;
                END IF;

                DELETE FROM session_state_items WHERE session_id = p_session_id;
                RETURN TRUE;
            END;
            $$;

            CREATE OR REPLACE FUNCTION insert_or_update_state_item(
                p_session_id TEXT,
                p_new_item BOOLEAN,
                p_initialized BOOLEAN,
                p_lock_cookie INTEGER,
                p_timeout_minutes INTEGER,
                p_item_size BIGINT,
                p_item BYTEA
            ) RETURNS VOID
            LANGUAGE plpgsql AS $$
            BEGIN
                PERFORM write_state_header(
                    p_session_id, p_new_item, p_initialized, p_lock_cookie,
                    p_timeout_minutes, p_item_size, p_item
                );
            END;
            $$;

            CREATE OR REPLACE FUNCTION insert_or_update_state_item_medium(
                p_session_id TEXT,
                p_new_item BOOLEAN,
                p_initialized BOOLEAN,
                p_lock_cookie INTEGER,
                p_timeout_minutes INTEGER,
                p_item_size BIGINT,
                p_item1 BYTEA,
                p_item2 BYTEA,
                p_item3 BYTEA,
                p_item4 BYTEA,
                p_item5 BYTEA,
                p_item6 BYTEA,
                p_item7 BYTEA,
                p_item8 BYTEA,
                p_item9 BYTEA
            ) RETURNS VOID
            LANGUAGE plpgsql AS $$
            BEGIN
                IF NOT write_state_header(
                    p_session_id, p_new_item, p_initialized, p_lock_cookie,
                    p_timeout_minutes, p_item_size, NULL
                ) THEN
                    RETURN;
                END IF;

                INSERT INTO session_state_items (session_id, session_item_id, item)
                SELECT p_session_id, blocks.position::INTEGER, blocks.item
                FROM unnest(ARRAY[
                    p_item1, p_item2, p_item3, p_item4, p_item5,
                    p_item6, p_item7, p_item8, p_item9
                ]) WITH ORDINALITY AS blocks(item, position)
                WHERE blocks.item IS NOT NULL;
            END;
            $$;

            CREATE OR REPLACE FUNCTION insert_or_update_state_item_large(
                p_session_id TEXT,
                p_new_item BOOLEAN,
                p_initialized BOOLEAN,
                p_lock_cookie INTEGER,
                p_timeout_minutes INTEGER,
                p_item_size BIGINT,
                p_sequence_ids INTEGER[],
                p_items BYTEA[]
            ) RETURNS VOID
            LANGUAGE plpgsql AS $$
            BEGIN
                IF NOT write_state_header(
                    p_session_id, p_new_item, p_initialized, p_lock_cookie,
                    p_timeout_minutes, p_item_size, NULL
                ) THEN
                    RETURN;
                END IF;

                INSERT INTO session_state_items (session_id, session_item_id, item)
                SELECT p_session_id, blocks.sequence_id, blocks.item
                FROM unnest(p_sequence_ids, p_items) AS blocks(sequence_id, item);
            END;
            $$
        "#,
    },
    Migration {
        version: 3,
        description: "Create session state read and lock procedures",
        up_sql: r#"
            CREATE OR REPLACE FUNCTION get_state_item(p_session_id TEXT)
            RETURNS TABLE (
                out_locked BOOLEAN,
                out_lock_age INTEGER,
                out_lock_cookie INTEGER,
                out_initialized BOOLEAN,
                out_item_size BIGINT,
                out_item BYTEA
            )
            LANGUAGE plpgsql AS $$
            BEGIN
                RETURN QUERY
                WITH touched AS (
                    UPDATE session_state AS s
                    SET expires_at = NOW() + make_interval(mins => s.timeout_minutes)
                    WHERE s.session_id = p_session_id AND s.expires_at > NOW()
                    RETURNING s.locked, s.lock_date, s.lock_cookie, s.initialized,
                              s.item_size, s.item
                )
                SELECT t.locked,
                       EXTRACT(EPOCH FROM (NOW() - t.lock_date))::INTEGER,
                       t.lock_cookie,
                       t.initialized,
                       t.item_size,
                       CASE WHEN t.locked THEN NULL ELSE t.item END
                FROM touched AS t;
            END;
            $$;

            CREATE OR REPLACE FUNCTION get_state_item_exclusive(p_session_id TEXT)
            RETURNS TABLE (
                out_locked BOOLEAN,
                out_lock_age INTEGER,
                out_lock_cookie INTEGER,
                out_initialized BOOLEAN,
                out_item_size BIGINT,
                out_item BYTEA
            )
            LANGUAGE plpgsql AS $$
            DECLARE
                r session_state%ROWTYPE;
            BEGIN
                SELECT * INTO r
                FROM session_state
                WHERE session_id = p_session_id AND expires_at > NOW()
                FOR UPDATE;

                IF NOT FOUND THEN
                    RETURN;
                END IF;

                IF r.locked THEN
                    UPDATE session_state
                    SET expires_at = NOW() + make_interval(mins => r.timeout_minutes)
                    WHERE session_id = p_session_id;

                    out_locked := TRUE;
                    out_lock_age := EXTRACT(EPOCH FROM (NOW() - r.lock_date))::INTEGER;
                    out_lock_cookie := r.lock_cookie;
                    out_initialized := r.initialized;
                    out_item_size := r.item_size;
                    out_item := NULL;
                    RETURN NEXT;
                    RETURN;
                END IF;

                UPDATE session_state
                SET expires_at = NOW() + make_interval(mins => r.timeout_minutes),
                    lock_date = NOW(),
                    locked = TRUE,
                    lock_cookie = r.lock_cookie + 1
                WHERE session_id = p_session_id;

                out_locked := FALSE;
                out_lock_age := 0;
                out_lock_cookie := r.lock_cookie + 1;
                out_initialized := r.initialized;
                out_item_size := r.item_size;
                out_item := r.item;
                RETURN NEXT;
            END;
            $$;

            CREATE OR REPLACE FUNCTION release_state_item_exclusive(
                p_session_id TEXT,
                p_lock_cookie INTEGER
            ) RETURNS VOID
            LANGUAGE sql AS $$
                UPDATE session_state
                SET locked = FALSE,
                    expires_at = NOW() + make_interval(mins => timeout_minutes)
                WHERE session_id = p_session_id AND lock_cookie = p_lock_cookie;
            $$;

            CREATE OR REPLACE FUNCTION remove_state_item(
                p_session_id TEXT,
                p_lock_cookie INTEGER
            ) RETURNS VOID
            LANGUAGE sql AS $$
                DELETE FROM session_state
                WHERE session_id = p_session_id AND lock_cookie = p_lock_cookie;
            $$;

            CREATE OR REPLACE FUNCTION reset_state_item_timeout(p_session_id TEXT)
            RETURNS VOID
            LANGUAGE sql AS $$
                UPDATE session_state
                SET expires_at = NOW() + make_interval(mins => timeout_minutes)
                WHERE session_id = p_session_id;
            $$
        "#,
    },
    Migration {
        version: 4,
        description: "Create expired session purge procedure",
        up_sql: r#"
            CREATE OR REPLACE FUNCTION delete_expired_session_state()
            RETURNS BIGINT
            LANGUAGE sql AS $$
                WITH purged AS (
                    DELETE FROM session_state
                    WHERE expires_at < NOW()
                    RETURNING 1
                )
                SELECT COUNT(*) FROM purged;
            $$
        "#,
    },
];

fn migration_error(context: String, err: sqlx::Error) -> Error {
    Error::store_unavailable_with(context, map_sqlx_error(err))
}

/// Run all pending migrations
///
/// Creates a `schema_migrations` table to track which migrations have been applied,
/// then runs any migrations that haven't been applied yet.
pub async fn run_migrations(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
        .map_err(|e| migration_error("Failed to acquire migration lock".to_string(), e))?;

    let result = apply_pending(conn).await;

    if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
    {
        warn!("Failed to release migration lock: {}", e);
    }

    result
}

async fn apply_pending(conn: &mut PgConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| migration_error("Failed to create schema_migrations table".to_string(), e))?;

    let applied_versions: Vec<i32> = sqlx::query_scalar("SELECT version FROM schema_migrations")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| migration_error("Failed to fetch applied migrations".to_string(), e))?;

    debug!(
        "Found {} applied migrations: {:?}",
        applied_versions.len(),
        applied_versions
    );

    for migration in MIGRATIONS {
        if applied_versions.contains(&migration.version) {
            debug!(
                "Skipping migration {}: {} (already applied)",
                migration.version, migration.description
            );
            continue;
        }

        info!(
            "Applying migration {}: {}",
            migration.version, migration.description
        );

        // Function bodies hold several statements; send them unprepared
        sqlx::raw_sql(migration.up_sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                migration_error(format!("Failed to apply migration {}", migration.version), e)
            })?;

        sqlx::query(
            "INSERT INTO schema_migrations (version, description) VALUES ($1, $2)
                ON CONFLICT (version) DO NOTHING",
        )
        .bind(migration.version)
        .bind(migration.description)
        .execute(&mut *conn)
        .await
        .map_err(|e| migration_error(format!("Failed to record migration {}", migration.version), e))?;
    }

    Ok(())
}

/// Get the current schema version
pub async fn get_current_version(conn: &mut PgConnection) -> Result<Option<i32>> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS (
            SELECT FROM information_schema.tables
            WHERE table_name = 'schema_migrations'
        )
        "#,
    )
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| migration_error("Failed to check for schema_migrations table".to_string(), e))?;

    if !table_exists {
        return Ok(None);
    }

    let version: Option<i32> = sqlx::query_scalar("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| migration_error("Failed to get current schema version".to_string(), e))?;

    Ok(version)
}
