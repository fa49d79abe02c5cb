//! sqlx-backed connector and connection
//!
//! Every procedure call is a `SELECT` of the PL/pgSQL function installed by
//! the migrations. sqlx caches the prepared statement per connection, so each
//! call is parsed once for the lifetime of the connection.

use async_trait::async_trait;
use futures::TryStreamExt;
use sqlsession_core::{Error, LockCookie, Result};
use sqlsession_engine::{
    CallReply, Connector, DbError, DbErrorKind, DbResult, ItemReply, ProcedureCall, StoreConfig,
    StoreConnection, WriteHeader,
};
use sqlsession_storage::{BlockPool, Chunk};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow};
use sqlx::{ConnectOptions, Connection, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

use crate::sqlstate::map_sqlx_error;

/// Opens connections to one PostgreSQL database
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
    target: String,
    integrated_security: bool,
}

impl PgConnector {
    /// Create a connector for `database_url`
    ///
    /// Integrated security is assumed when the URL carries no password,
    /// either as `user:password@` or as a `password` query parameter; the
    /// server then authenticates the login through peer, GSSAPI or SSPI.
    ///
    /// A password supplied out of band through `PGPASSWORD` or a passfile is
    /// not visible here. Set `integrated_security = false` in the store
    /// configuration for those logins so their connections are pooled.
    pub fn new(database_url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| Error::Config(format!("invalid database URL: {}", e)))?;
        let target = format!(
            "{}:{}/{}",
            options.get_host(),
            options.get_port(),
            options.get_database().unwrap_or_default()
        );

        Ok(Self {
            options,
            target,
            integrated_security: !url_has_password(database_url),
        })
    }

    /// Create a connector from a store configuration
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let mut connector = Self::new(&config.connection_string)?;
        if let Some(integrated) = config.integrated_security {
            connector.integrated_security = integrated;
        }
        // sqlx logs every statement by default
        if !config.logging.log_sql_queries {
            connector.options = connector.options.disable_statement_logging();
        }
        Ok(connector)
    }

    /// Open a bare sqlx connection, for migrations and maintenance
    pub async fn connect_raw(&self) -> DbResult<PgConnection> {
        self.options.connect().await.map_err(map_sqlx_error)
    }
}

/// A non-empty password in the URL userinfo or its `password` query parameter
fn url_has_password(url: &str) -> bool {
    let Some((_, rest)) = url.split_once("://") else {
        return false;
    };
    let (location, query) = rest.split_once('?').unwrap_or((rest, ""));

    let authority = location.split('/').next().unwrap_or_default();
    let in_userinfo = authority.rsplit_once('@').is_some_and(|(userinfo, _)| {
        userinfo
            .split_once(':')
            .is_some_and(|(_, password)| !password.is_empty())
    });

    in_userinfo
        || query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .any(|(key, value)| key == "password" && !value.is_empty())
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> DbResult<Box<dyn StoreConnection>> {
        let conn = self.connect_raw().await?;
        debug!("Opened session state connection to {}", self.target);
        Ok(Box::new(PgStoreConnection {
            conn: Some(conn),
            broken: false,
        }))
    }

    fn target(&self) -> &str {
        &self.target
    }

    fn uses_integrated_security(&self) -> bool {
        self.integrated_security
    }
}

/// One open PostgreSQL connection
pub struct PgStoreConnection {
    conn: Option<PgConnection>,
    // Set once a severe error leaves the connection unusable
    broken: bool,
}

#[async_trait]
impl StoreConnection for PgStoreConnection {
    fn is_open(&self) -> bool {
        self.conn.is_some() && !self.broken
    }

    async fn execute(&mut self, call: &ProcedureCall<'_>, blocks: &BlockPool) -> DbResult<CallReply> {
        let conn = match self.conn.as_mut() {
            Some(conn) if !self.broken => conn,
            _ => return Err(DbError::new(DbErrorKind::Severe, "connection is closed")),
        };

        let result = run_call(conn, call, blocks).await;
        if let Err(err) = &result {
            if err.breaks_connection() {
                self.broken = true;
            }
        }
        result
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                debug!("Error closing session state connection: {}", e);
            }
        }
    }
}

async fn run_call(
    conn: &mut PgConnection,
    call: &ProcedureCall<'_>,
    blocks: &BlockPool,
) -> DbResult<CallReply> {
    match call {
        ProcedureCall::InsertOrUpdateItemSmall { header, item } => {
            bind_header(
                sqlx::query("SELECT insert_or_update_state_item($1, $2, $3, $4, $5, $6, $7)"),
                header,
            )
            .bind(*item)
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        ProcedureCall::InsertOrUpdateItemMedium { header, items } => {
            let mut query = bind_header(
                sqlx::query(
                    "SELECT insert_or_update_state_item_medium(\
                     $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
                ),
                header,
            );
            for item in items {
                query = query.bind(*item);
            }
            query.execute(&mut *conn).await.map_err(map_sqlx_error)?;
        }
        ProcedureCall::InsertOrUpdateItemLarge { header, items } => {
            let sequence_ids: Vec<i32> = items.iter().map(|record| record.sequence_id).collect();
            let item_blocks: Vec<&[u8]> = items.iter().map(|record| record.block).collect();
            bind_header(
                sqlx::query("SELECT insert_or_update_state_item_large($1, $2, $3, $4, $5, $6, $7, $8)"),
                header,
            )
            .bind(&sequence_ids[..])
            .bind(&item_blocks[..])
            .execute(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;
        }
        ProcedureCall::GetItem {
            session_id,
            exclusive,
        } => return get_item(conn, session_id, *exclusive, blocks).await,
        ProcedureCall::ReleaseItemExclusive {
            session_id,
            lock_cookie,
        } => {
            sqlx::query("SELECT release_state_item_exclusive($1, $2)")
                .bind(*session_id)
                .bind(lock_cookie.value())
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        ProcedureCall::RemoveItem {
            session_id,
            lock_cookie,
        } => {
            sqlx::query("SELECT remove_state_item($1, $2)")
                .bind(*session_id)
                .bind(lock_cookie.value())
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        ProcedureCall::ResetItemTimeout { session_id } => {
            sqlx::query("SELECT reset_state_item_timeout($1)")
                .bind(*session_id)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }
    }
    Ok(CallReply::Done)
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_header<'q>(query: PgQuery<'q>, header: &WriteHeader<'q>) -> PgQuery<'q> {
    query
        .bind(header.session_id)
        .bind(header.new_item)
        .bind(header.initialized)
        .bind(header.lock_cookie.value())
        .bind(header.timeout_minutes)
        .bind(header.item_size)
}

/// Read the header row and any chunk rows under one repeatable-read snapshot
async fn get_item(
    conn: &mut PgConnection,
    session_id: &str,
    exclusive: bool,
    blocks: &BlockPool,
) -> DbResult<CallReply> {
    let mut tx = conn.begin().await.map_err(map_sqlx_error)?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

    let sql = if exclusive {
        "SELECT * FROM get_state_item_exclusive($1)"
    } else {
        "SELECT * FROM get_state_item($1)"
    };
    let row = sqlx::query(sql)
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

    let Some(row) = row else {
        tx.commit().await.map_err(map_sqlx_error)?;
        return Ok(CallReply::NotFound);
    };
    let mut reply = item_reply(&row).map_err(map_sqlx_error)?;

    if !reply.locked && reply.item.is_none() && reply.item_size.is_some_and(|size| size > 0) {
        // No ORDER BY; reassembly sorts by sequence id
        let mut rows = sqlx::query(
            "SELECT session_item_id, item FROM session_state_items WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch(&mut *tx);

        while let Some(row) = rows.try_next().await.map_err(map_sqlx_error)? {
            let sequence_id: i32 = row.try_get(0).map_err(map_sqlx_error)?;
            let bytes: &[u8] = row.try_get(1).map_err(map_sqlx_error)?;
            let mut block = blocks.acquire();
            block.extend_from_slice(bytes);
            reply.chunks.push(Chunk { sequence_id, block });
        }
    }

    tx.commit().await.map_err(map_sqlx_error)?;
    Ok(CallReply::Item(reply))
}

fn item_reply(row: &PgRow) -> std::result::Result<ItemReply, sqlx::Error> {
    let lock_age_secs: i32 = row.try_get("out_lock_age")?;
    Ok(ItemReply {
        locked: row.try_get("out_locked")?,
        lock_age: Duration::from_secs(lock_age_secs.max(0) as u64),
        lock_cookie: LockCookie(row.try_get("out_lock_cookie")?),
        initialized: row.try_get("out_initialized")?,
        item_size: row.try_get("out_item_size")?,
        item: row.try_get("out_item")?,
        chunks: Vec::new(),
    })
}
