//! PostgreSQL dialect for the log sink.

use super::{ProvisionReport, SinkTarget, StoredLog};
use crate::record::LogRecord;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// SQLSTATE codes raised when two processes create the same catalog object at once
const CONCURRENT_CREATE_CODES: [&str; 3] = ["23505", "42P06", "42P07"];

pub async fn connect(connection_string: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .connect(connection_string)
        .await
}

fn qualified_table(target: &SinkTarget) -> String {
    format!(r#""{}"."{}""#, target.schema(), target.table())
}

async fn schema_exists(pool: &PgPool, schema: &str) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
    )
    .bind(schema)
    .fetch_one(pool)
    .await
}

async fn table_exists(pool: &PgPool, target: &SinkTarget) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables
                        WHERE table_schema = $1 AND table_name = $2)",
    )
    .bind(target.schema())
    .bind(target.table())
    .fetch_one(pool)
    .await
}

fn is_concurrent_create(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| CONCURRENT_CREATE_CODES.contains(&&*code))
        .unwrap_or(false)
}

async fn ensure_objects(pool: &PgPool, target: &SinkTarget) -> Result<ProvisionReport, sqlx::Error> {
    let schema_created = if schema_exists(pool, target.schema()).await? {
        false
    } else {
        info!("Creating log schema {}", target.schema());
        sqlx::query(&format!(r#"CREATE SCHEMA IF NOT EXISTS "{}""#, target.schema()))
            .execute(pool)
            .await?;
        true
    };

    let table = qualified_table(target);
    let table_created = if table_exists(pool, target).await? {
        false
    } else {
        info!("Creating log table {}", table);
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                timestamp TIMESTAMPTZ NOT NULL,
                level VARCHAR(20) NOT NULL,
                category VARCHAR(256),
                message TEXT,
                exception TEXT NULL,
                trace_id VARCHAR(100) NULL,
                span_id VARCHAR(100) NULL,
                machine VARCHAR(100) NULL
            )"
        ))
        .execute(pool)
        .await?;
        true
    };

    sqlx::query(&format!(
        r#"CREATE INDEX IF NOT EXISTS "ix_{}_timestamp" ON {table} (timestamp DESC)"#,
        target.table()
    ))
    .execute(pool)
    .await?;

    Ok(ProvisionReport {
        target: target.display_name(),
        schema_created,
        table_created,
    })
}

/// Ensure schema, table and index exist
///
/// `IF NOT EXISTS` is not race-free on PostgreSQL: two instances starting together can
/// both pass the check and collide on the catalog. That collision is retried once, after
/// which the objects exist.
pub async fn provision(pool: &PgPool, target: &SinkTarget) -> Result<ProvisionReport, sqlx::Error> {
    retry_concurrent_create(&target.display_name(), || ensure_objects(pool, target)).await
}

/// Run `attempt`, running it a second time only if the first lost a catalog race
async fn retry_concurrent_create<T, F, Fut>(object: &str, mut attempt: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    match attempt().await {
        Err(err) if is_concurrent_create(&err) => {
            warn!(
                "Concurrent provisioning of {} detected ({}), retrying once",
                object, err
            );
            attempt().await
        }
        other => other,
    }
}

pub async fn insert_batch(
    pool: &PgPool,
    target: &SinkTarget,
    records: &[LogRecord],
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {}
         (timestamp, level, category, message, exception, trace_id, span_id, machine)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        qualified_table(target)
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
    pool: &PgPool,
    target: &SinkTarget,
    limit: u32,
) -> Result<Vec<StoredLog>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT id, timestamp, level, category, message, exception, trace_id, span_id, machine
         FROM {} ORDER BY timestamp DESC, id DESC LIMIT $1",
        qualified_table(target)
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

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Server error carrying only a SQLSTATE
    #[derive(Debug)]
    struct SqlState(&'static str);

    impl std::fmt::Display for SqlState {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "sqlstate {}", self.0)
        }
    }

    impl std::error::Error for SqlState {}

    impl DatabaseError for SqlState {
        fn message(&self) -> &str {
            "catalog error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed(self.0))
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    fn sqlstate(code: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(SqlState(code)))
    }

    #[test]
    fn test_qualified_table_is_quoted() {
        let target = SinkTarget::new("Logging", "SystemLogs").unwrap();
        assert_eq!(qualified_table(&target), r#""Logging"."SystemLogs""#);
    }

    #[test]
    fn test_catalog_collisions_are_recognised() {
        for code in CONCURRENT_CREATE_CODES {
            assert!(is_concurrent_create(&sqlstate(code)), "{} not recognised", code);
        }
        assert!(!is_concurrent_create(&sqlstate("42601")));
        assert!(!is_concurrent_create(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn test_collision_is_retried_once() {
        let calls = AtomicUsize::new(0);
        let result = retry_concurrent_create("logging.system_logs", || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Err(sqlstate("42P07"))
                } else {
                    Ok(call)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_second_collision_is_returned() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_concurrent_create("logging.system_logs", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlstate("42P06")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = retry_concurrent_create("logging.system_logs", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(sqlstate("42501")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
