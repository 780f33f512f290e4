//!
//! # Database Module for logvault
//!
//! This module owns everything that talks to the relational sink: choosing a dialect
//! from the connection string, caching a connection pool per connection string,
//! provisioning the log table, and writing batches inside a single transaction.
//!
//! ## Supported sinks
//!
//! - **SQLite** (`sqlite:` URLs): no schemas, so the schema name becomes a table-name
//!   prefix (`logging_system_logs`). The database file is created if missing.
//! - **PostgreSQL** (`postgres:` / `postgresql:` URLs): real `CREATE SCHEMA`.
//!
//! ## Connection handling
//!
//! The connection string is resolved by the caller on every attempt. [`SqlSink`] keeps
//! one pool for the most recently seen string and rebuilds it when the string changes,
//! so rotated credentials take effect on the next attempt without a restart.

pub mod postgres;
pub mod sqlite;

#[cfg(test)]
pub mod memory;

use crate::error::PipelineError;
use crate::record::LogRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::PgPool;
use sqlx::sqlite::SqlitePool;
use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_SCHEMA_NAME: &str = "logging";
pub const DEFAULT_TABLE_NAME: &str = "system_logs";
const MAX_IDENTIFIER_LEN: usize = 63;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Traits                             ****//
///////////////////////////////////////////////////////////////////////////////

/// A relational store that log batches are persisted to
pub trait LogSink: Send + Sync + 'static {
    /// Ensure the schema and table exist. Must be idempotent and non-destructive.
    fn provision(
        &self,
        connection_string: &str,
    ) -> impl Future<Output = Result<ProvisionReport, PipelineError>> + Send;

    /// Insert every record inside one transaction, returning the number of rows written
    fn write_batch(
        &self,
        connection_string: &str,
        records: &[LogRecord],
    ) -> impl Future<Output = Result<u64, PipelineError>> + Send;
}

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Validated `(schema, table)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkTarget {
    schema: String,
    table: String,
}

/// Outcome of a provisioning run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionReport {
    pub target: String,
    pub schema_created: bool,
    pub table_created: bool,
}

/// Which SQL dialect a connection string speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Sqlite,
    Postgres,
}

/// A connection pool for one of the supported dialects
#[derive(Debug, Clone)]
pub enum SinkPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

/// A row read back from the log table
#[derive(Debug, Clone, Serialize)]
pub struct StoredLog {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub category: Option<String>,
    pub message: Option<String>,
    pub exception: Option<String>,
    pub trace_id: Option<String>,
    pub span_id: Option<String>,
    pub machine: Option<String>,
}

struct CachedPool {
    connection_string: String,
    pool: SinkPool,
}

/// SQL-backed [`LogSink`] with a pool cached per connection string
pub struct SqlSink {
    target: SinkTarget,
    cached: Mutex<Option<CachedPool>>,
}

impl SinkTarget {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Result<Self, PipelineError> {
        let schema = schema.into();
        let table = table.into();
        validate_identifier(&schema)?;
        validate_identifier(&table)?;
        Ok(Self { schema, table })
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Human-readable `schema.table`
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

impl Default for SinkTarget {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA_NAME.to_string(),
            table: DEFAULT_TABLE_NAME.to_string(),
        }
    }
}

impl SinkKind {
    pub fn from_url(connection_string: &str) -> Result<Self, PipelineError> {
        let scheme = connection_string
            .split(':')
            .next()
            .unwrap_or_default()
            .to_lowercase();
        match scheme.as_str() {
            "sqlite" => Ok(SinkKind::Sqlite),
            "postgres" | "postgresql" => Ok(SinkKind::Postgres),
            _ => Err(PipelineError::UnsupportedSink { url_scheme: scheme }),
        }
    }
}

impl SinkPool {
    /// Open a pool for the dialect named by the connection string
    pub async fn connect(connection_string: &str) -> Result<Self, PipelineError> {
        match SinkKind::from_url(connection_string)? {
            SinkKind::Sqlite => Ok(SinkPool::Sqlite(sqlite::connect(connection_string).await?)),
            SinkKind::Postgres => Ok(SinkPool::Postgres(
                postgres::connect(connection_string).await?,
            )),
        }
    }

    pub fn kind(&self) -> SinkKind {
        match self {
            SinkPool::Sqlite(_) => SinkKind::Sqlite,
            SinkPool::Postgres(_) => SinkKind::Postgres,
        }
    }

    /// Round-trip a trivial query to prove the sink is reachable
    pub async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            SinkPool::Sqlite(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
            SinkPool::Postgres(pool) => sqlx::query("SELECT 1").execute(pool).await.map(|_| ()),
        }
    }

    pub async fn close(&self) {
        match self {
            SinkPool::Sqlite(pool) => pool.close().await,
            SinkPool::Postgres(pool) => pool.close().await,
        }
    }
}

impl SqlSink {
    pub fn new(target: SinkTarget) -> Self {
        Self {
            target,
            cached: Mutex::new(None),
        }
    }

    pub fn target(&self) -> &SinkTarget {
        &self.target
    }

    /// Pool for `connection_string`, reconnecting if it differs from the cached one
    pub async fn pool_for(&self, connection_string: &str) -> Result<SinkPool, PipelineError> {
        let mut cached = self.cached.lock().await;
        if let Some(existing) = cached.as_ref() {
            if existing.connection_string == connection_string {
                return Ok(existing.pool.clone());
            }
        }

        let pool = SinkPool::connect(connection_string).await?;
        if let Some(previous) = cached.take() {
            info!("Sink connection string changed, replacing connection pool");
            previous.pool.close().await;
        }
        debug!(kind = ?pool.kind(), "Opened sink connection pool");
        *cached = Some(CachedPool {
            connection_string: connection_string.to_string(),
            pool: pool.clone(),
        });
        Ok(pool)
    }

    /// Newest records first, using the descending timestamp index
    pub async fn recent_logs(
        &self,
        connection_string: &str,
        limit: u32,
    ) -> Result<Vec<StoredLog>, PipelineError> {
        match self.pool_for(connection_string).await? {
            SinkPool::Sqlite(pool) => Ok(sqlite::recent_logs(&pool, &self.target, limit).await?),
            SinkPool::Postgres(pool) => {
                Ok(postgres::recent_logs(&pool, &self.target, limit).await?)
            }
        }
    }
}

impl LogSink for SqlSink {
    async fn provision(&self, connection_string: &str) -> Result<ProvisionReport, PipelineError> {
        // An unreachable sink at startup is a provisioning failure, not a transient one
        let pool = self
            .pool_for(connection_string)
            .await
            .map_err(|e| match e {
                PipelineError::Database(e) => PipelineError::Provisioning(e),
                other => other,
            })?;
        pool.ping().await.map_err(PipelineError::Provisioning)?;
        let report = match pool {
            SinkPool::Sqlite(pool) => sqlite::provision(&pool, &self.target).await,
            SinkPool::Postgres(pool) => postgres::provision(&pool, &self.target).await,
        };
        report.map_err(PipelineError::Provisioning)
    }

    async fn write_batch(
        &self,
        connection_string: &str,
        records: &[LogRecord],
    ) -> Result<u64, PipelineError> {
        match self.pool_for(connection_string).await? {
            SinkPool::Sqlite(pool) => Ok(sqlite::insert_batch(&pool, &self.target, records).await?),
            SinkPool::Postgres(pool) => {
                Ok(postgres::insert_batch(&pool, &self.target, records).await?)
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Check that a schema or table name is safe to interpolate into DDL
pub fn validate_identifier(name: &str) -> Result<(), PipelineError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(())
    } else {
        Err(PipelineError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
