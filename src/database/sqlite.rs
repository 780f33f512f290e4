//! SQLite dialect for the log sink.
//!
//! SQLite has no schemas, so the table is named `{schema}_{table}` in the main database.

use super::{ProvisionReport, SinkTarget, StoredLog};
use crate::record::LogRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Open a single-connection pool, creating the database file if needed
///
/// One connection keeps `sqlite::memory:` databases alive across attempts and matches
/// SQLite's single-writer model.
pub async fn connect(connection_string: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(connection_string)?.create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(0)
        .idle_timeout(None)
        .max_lifetime(None)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
}

pub fn table_name(target: &SinkTarget) -> String {
    format!("{}_{}", target.schema(), target.table())
}

fn index_name(target: &SinkTarget) -> String {
    format!("ix_{}_timestamp", table_name(target))
}

async fn table_exists(pool: &SqlitePool, table: &str) -> Result<bool, sqlx::Error> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(pool)
            .await?;
    Ok(count > 0)
}

/// Create the log table and its timestamp index if they are missing
pub async fn provision(
    pool: &SqlitePool,
    target: &SinkTarget,
) -> Result<ProvisionReport, sqlx::Error> {
    let table = table_name(target);
    let table_created = if table_exists(pool, &table).await? {
        false
    } else {
        info!("Creating log table {}", table);
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS "{table}" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                level VARCHAR(20) NOT NULL,
                category VARCHAR(256),
                message TEXT,
                exception TEXT NULL,
                trace_id VARCHAR(100) NULL,
                span_id VARCHAR(100) NULL,
                machine VARCHAR(100) NULL
            )"#
        ))
        .execute(pool)
        .await?;
        true
    };

    sqlx::query(&format!(
        r#"CREATE INDEX IF NOT EXISTS "{}" ON "{table}" (timestamp DESC)"#,
        index_name(target)
    ))
    .execute(pool)
    .await?;

    Ok(ProvisionReport {
        target: table,
        schema_created: false,
        table_created,
    })
}

/// Insert all records in one transaction; any failure rolls the whole batch back
pub async fn insert_batch(
    pool: &SqlitePool,
    target: &SinkTarget,
    records: &[LogRecord],
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        r#"INSERT INTO "{}"
         (timestamp, level, category, message, exception, trace_id, span_id, machine)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
        table_name(target)
    );

    let mut tx = pool.begin().await?;
    let mut written = 0;
    for record in records {
        written += sqlx::query(&sql)
            .bind(record.timestamp())
            .bind(record.level().as_str())
            .bind(record.category())
            .bind(record.message())
            .bind(record.exception())
            .bind(record.trace_id())
            .bind(record.span_id())
            .bind(record.machine())
            .execute(&mut *tx)
            .await?
            .rows_affected();
    }
    tx.commit().await?;
    Ok(written)
}

pub async fn recent_logs(
    pool: &SqlitePool,
    target: &SinkTarget,
    limit: u32,
) -> Result<Vec<StoredLog>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        r#"SELECT id, timestamp, level, category, message, exception, trace_id, span_id, machine
         FROM "{}" ORDER BY timestamp DESC, id DESC LIMIT ?"#,
        table_name(target)
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| StoredLog {
            id: row.get("id"),
            timestamp: row.get("timestamp"),
            level: row.get("level"),
            category: row.get("category"),
            message: row.get("message"),
            exception: row.get("exception"),
            trace_id: row.get("trace_id"),
            span_id: row.get("span_id"),
            machine: row.get("machine"),
        })
        .collect())
}
