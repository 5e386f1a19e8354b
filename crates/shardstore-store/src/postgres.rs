//! PostgreSQL backend over sqlx.
//!
//! One `PgConnection` per session connection; sessions own their connections,
//! so there is no pool.

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::ExposeSecret;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgDatabaseError, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, Postgres, Row, TypeInfo};
use uuid::Uuid;

use shardstore_core::DbError;

use crate::backend::{Connector, DbConnection, DbRow, SqlValue};
use crate::command::Command;
use crate::connection::ConnectionParams;

const UNIQUE_VIOLATION: &str = "23505";
const DUPLICATE_TABLE: &str = "42P07";

#[derive(Clone, Copy, Debug, Default)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn create(&self, params: ConnectionParams) -> Box<dyn DbConnection> {
        Box::new(PgDbConnection { params, conn: None })
    }
}

pub struct PgDbConnection {
    params: ConnectionParams,
    conn: Option<PgConnection>,
}

pub fn connect_options(params: &ConnectionParams) -> PgConnectOptions {
    let mut opts = PgConnectOptions::new();
    if let Some(host) = &params.host {
        opts = opts.host(host);
    }
    if let Some(port) = params.port {
        opts = opts.port(port);
    }
    if let Some(db) = &params.database {
        opts = opts.database(db);
    }
    if let Some(user) = &params.username {
        opts = opts.username(user);
    }
    if let Some(pw) = &params.password {
        opts = opts.password(pw.expose_secret());
    }
    if let Some(app) = &params.application_name {
        opts = opts.application_name(app);
    }
    opts
}

/// Normalise a driver error into the backend taxonomy.
pub fn classify(err: sqlx::Error) -> DbError {
    match &err {
        sqlx::Error::Database(db) => {
            let pg = db.try_downcast_ref::<PgDatabaseError>();
            classify_sqlstate(
                db.code().as_deref(),
                db.message(),
                pg.and_then(|e| e.detail()),
                pg.and_then(|e| e.table()),
            )
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => DbError::Connection(err.to_string()),
        _ => DbError::Command(err.to_string()),
    }
}

/// Map a server error by SQLSTATE.
///
/// Only a duplicate table counts as existing storage. A duplicate schema
/// aborts the DDL block before any table is created, so it stays a command
/// error and the next caller runs the block again.
pub fn classify_sqlstate(
    code: Option<&str>,
    message: &str,
    detail: Option<&str>,
    table: Option<&str>,
) -> DbError {
    match code {
        Some(UNIQUE_VIOLATION) => DbError::UniqueViolation {
            message: message.to_string(),
            detail: detail.map(str::to_string),
            table: table.map(str::to_string),
        },
        Some(DUPLICATE_TABLE) => DbError::AlreadyExists(message.to_string()),
        _ => DbError::Command(message.to_string()),
    }
}

fn bind_all(
    mut query: Query<'_, Postgres, PgArguments>,
    params: Vec<SqlValue>,
) -> Query<'_, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlValue::Uuid(u) => query.bind(u),
            SqlValue::Text(t) => query.bind(t),
            SqlValue::SmallInt(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Bytes(b) => query.bind(b.map(|b| b.to_vec())),
        };
    }
    query
}

fn decode_row(row: &PgRow) -> Result<DbRow, DbError> {
    let mut values = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "UUID" => row.try_get::<Uuid, _>(idx).map(SqlValue::Uuid),
            "INT2" => row.try_get::<i16, _>(idx).map(SqlValue::SmallInt),
            "INT4" => row.try_get::<i32, _>(idx).map(SqlValue::Int),
            "BYTEA" => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .map(|b| SqlValue::Bytes(b.map(Bytes::from))),
            _ => row.try_get::<Option<String>, _>(idx).map(SqlValue::Text),
        }
        .map_err(|e| DbError::Decode {
            column: idx,
            detail: e.to_string(),
        })?;
        values.push(value);
    }
    Ok(DbRow::new(values))
}

impl PgDbConnection {
    fn conn(&mut self) -> Result<&mut PgConnection, DbError> {
        self.conn.as_mut().ok_or(DbError::NotOpen)
    }
}

#[async_trait]
impl DbConnection for PgDbConnection {
    fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn open(&mut self) -> Result<(), DbError> {
        if self.conn.is_none() {
            let conn = PgConnection::connect_with(&connect_options(&self.params))
                .await
                .map_err(classify)?;
            self.conn = Some(conn);
        }
        Ok(())
    }

    async fn execute(&mut self, command: &Command) -> Result<u64, DbError> {
        let sql = command.sql();
        let params = command.params();
        let conn = self.conn()?;
        // a bare &str carries no arguments, so it goes over the simple
        // protocol and DO blocks and transaction control run unprepared
        let result = if params.is_empty() {
            Executor::execute(&mut *conn, sql.as_str()).await
        } else {
            bind_all(sqlx::query(&sql), params).execute(&mut *conn).await
        };
        result.map(|r| r.rows_affected()).map_err(classify)
    }

    async fn query(&mut self, command: &Command) -> Result<Vec<DbRow>, DbError> {
        let sql = command.sql();
        let params = command.params();
        let conn = self.conn()?;
        let rows = if params.is_empty() {
            Executor::fetch_all(&mut *conn, sql.as_str()).await
        } else {
            bind_all(sqlx::query(&sql), params).fetch_all(&mut *conn).await
        }
        .map_err(classify)?;
        rows.iter().map(decode_row).collect()
    }

    async fn close(&mut self) -> Result<(), DbError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await.map_err(classify)?;
        }
        Ok(())
    }
}
