//! PostgreSQL backend for holdings-load
//!
//! Provides PostgreSQL-specific implementations:
//! - Connection with explicit BEGIN/COMMIT transactions
//! - Savepoints for per-partition DDL isolation
//! - `COPY ... FROM STDIN` bulk transfer
//! - SQLSTATE-aware error mapping

use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tracing::{debug, error, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::security::validate_sql_identifier;

fn to_params<'a>(params: &'a [&'a str]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Whether a server error means the session is gone
fn is_connection_state(state: &SqlState) -> bool {
    state.code().starts_with("08")
        || *state == SqlState::ADMIN_SHUTDOWN
        || *state == SqlState::CRASH_SHUTDOWN
        || *state == SqlState::CANNOT_CONNECT_NOW
}

/// Map a tokio-postgres error, keeping the SQLSTATE for classification
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }

    let db_info = e
        .as_db_error()
        .map(|db| (db.code().clone(), db.message().to_string()));

    match db_info {
        Some((state, _)) if is_connection_state(&state) => {
            Error::connection_with_source(format!("server ended session ({})", state.code()), e)
        }
        Some((state, message)) => Error::Query {
            message,
            sql: Some(sql.to_string()),
            code: Some(state.code().to_string()),
            source: Some(Box::new(e)),
        },
        None => {
            let io_failure = std::error::Error::source(&e)
                .map(|s| s.is::<std::io::Error>())
                .unwrap_or(false);
            if io_failure {
                Error::connection_with_source("connection i/o failure", e)
            } else {
                Error::Query {
                    message: e.to_string(),
                    sql: Some(sql.to_string()),
                    code: None,
                    source: Some(Box::new(e)),
                }
            }
        }
    }
}

fn map_tx_error(e: tokio_postgres::Error, what: &str) -> Error {
    match map_pg_error(e, what) {
        Error::Query {
            message, source, ..
        } => Error::Transaction { message, source },
        other => other,
    }
}

async fn query_flag(client: &tokio_postgres::Client, sql: &str, params: &[&str]) -> Result<bool> {
    let row = client
        .query_opt(sql, &to_params(params))
        .await
        .map_err(|e| map_pg_error(e, sql))?;

    match row {
        Some(row) => row
            .try_get::<_, Option<bool>>(0)
            .map(|v| v.unwrap_or(false))
            .map_err(|e| Error::query_with_sql(e.to_string(), sql)),
        None => Ok(false),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<u64> {
        self.ensure_open()?;
        self.client
            .execute(sql, &to_params(params))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn query_flag(&self, sql: &str, params: &[&str]) -> Result<bool> {
        self.ensure_open()?;
        query_flag(&self.client, sql, params).await
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| map_tx_error(e, "BEGIN"))?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
            finished: AtomicBool::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction driven by explicit BEGIN/COMMIT on the session
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
    finished: AtomicBool,
}

impl PgTransaction {
    async fn control(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| map_tx_error(e, sql))
    }
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<u64> {
        self.client
            .execute(sql, &to_params(params))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn query_flag(&self, sql: &str, params: &[&str]) -> Result<bool> {
        query_flag(&self.client, sql, params).await
    }

    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64> {
        let sink = self
            .client
            .copy_in::<_, Bytes>(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;
        futures::pin_mut!(sink);

        sink.send(data).await.map_err(|e| map_pg_error(e, sql))?;
        let rows = sink
            .as_mut()
            .finish()
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        debug!(rows, "COPY finished");
        Ok(rows)
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        validate_sql_identifier(name)?;
        self.control(&format!("SAVEPOINT {}", name)).await
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        validate_sql_identifier(name)?;
        self.control(&format!("ROLLBACK TO SAVEPOINT {}", name))
            .await
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        validate_sql_identifier(name)?;
        self.control(&format!("RELEASE SAVEPOINT {}", name)).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.control("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finished.store(true, Ordering::Relaxed);
        self.control("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.finished.load(Ordering::Relaxed) {
            warn!("PgTransaction dropped without commit or rollback; session left inside transaction");
        }
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid connection url: {}", e)))?;

        pg.connect_timeout(config.connect_timeout());
        if let Some(name) = &config.application_name {
            pg.application_name(name);
        }
        if !config.properties.is_empty() {
            let mut keys: Vec<_> = config.properties.keys().collect();
            keys.sort();
            let options: Vec<String> = keys
                .into_iter()
                .map(|k| format!("-c {}={}", k, config.properties[k]))
                .collect();
            pg.options(options.join(" "));
        }

        let connect = pg.connect(tokio_postgres::NoTls);
        let (client, connection) = tokio::time::timeout(config.connect_timeout(), connect)
            .await
            .map_err(|_| {
                Error::connection(format!(
                    "timed out connecting to {} after {} ms",
                    config.redacted_url(),
                    config.connect_timeout_ms
                ))
            })?
            .map_err(|e| {
                Error::connection_with_source(
                    format!("failed to connect to {}", config.redacted_url()),
                    e,
                )
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        debug!(url = %config.redacted_url(), "connected to PostgreSQL");
        Ok(Box::new(PgConnection::new(client)))
    }
}
