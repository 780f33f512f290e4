//! # Schema Provisioner Module
//!
//! Runs once at startup, before the batch processor is allowed to start. It resolves the
//! sink connection string, proves the sink is reachable, and creates the log schema and
//! table if they are missing.
//!
//! Every failure here is fatal: a service that is supposed to persist its logs must not
//! start while silently dropping them. Failures are logged as critical and returned to the
//! caller, which aborts startup.

use crate::connection::{ConnectionSource, resolve};
use crate::database::{LogSink, ProvisionReport};
use crate::error::PipelineError;
use tracing::{error, info};

/// One-shot startup provisioning of the log sink
pub struct SchemaProvisioner<'a, C, S> {
    source: &'a C,
    sink: &'a S,
}

impl<'a, C: ConnectionSource, S: LogSink> SchemaProvisioner<'a, C, S> {
    pub fn new(source: &'a C, sink: &'a S) -> Self {
        Self { source, sink }
    }

    /// Ensure the sink is ready to receive batches
    pub async fn provision(&self) -> Result<ProvisionReport, PipelineError> {
        info!("Verifying SQL sink for log persistence...");

        let Some(connection_string) = resolve(self.source).await else {
            error!(
                severity = "critical",
                "SQL logging is enabled, but no sink connection string could be resolved. \
                 Set LOGVAULT_DB_URL or register a connection source."
            );
            return Err(PipelineError::ConnectionUnresolved);
        };

        match self.sink.provision(&connection_string).await {
            Ok(report) => {
                info!(
                    target_table = %report.target,
                    schema_created = report.schema_created,
                    table_created = report.table_created,
                    "SQL logging infrastructure ready"
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    severity = "critical",
                    error = %e,
                    "Failed to provision SQL logging infrastructure"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::StaticConnectionSource;
    use crate::database::memory::MemorySink;
    use crate::database::{SinkTarget, SqlSink};
    use crate::record::{LogLevel, LogRecord};

    #[tokio::test]
    async fn test_unresolved_connection_is_fatal() {
        let sink = MemorySink::new();
        let source = StaticConnectionSource::new("  ");
        let result = SchemaProvisioner::new(&source, &sink).provision().await;

        assert!(matches!(result, Err(PipelineError::ConnectionUnresolved)));
        assert_eq!(sink.provision_calls(), 0);
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_returned() {
        let sink = MemorySink::new();
        sink.fail_provisioning();
        let source = StaticConnectionSource::new("memory://sink");
        let result = SchemaProvisioner::new(&source, &sink).provision().await;

        assert!(matches!(result, Err(PipelineError::Provisioning(_))));
    }

    #[tokio::test]
    async fn test_unsupported_sink_is_fatal() {
        let sink = SqlSink::new(SinkTarget::default());
        let source = StaticConnectionSource::new("mysql://localhost/logs");
        let result = SchemaProvisioner::new(&source, &sink).provision().await;

        assert!(result.unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("logs.db").display()
        );
        let source = StaticConnectionSource::new(url);
        let sink = SqlSink::new(SinkTarget::default());

        let err = SchemaProvisioner::new(&source, &sink)
            .provision()
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Provisioning(_)));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_provisioning_twice_keeps_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("logs.db").display());
        let source = StaticConnectionSource::new(url.clone());
        let sink = SqlSink::new(SinkTarget::default());

        let first = SchemaProvisioner::new(&source, &sink).provision().await.unwrap();
        assert!(first.table_created);

        sink.write_batch(&url, &[LogRecord::new(LogLevel::Information, "boot", "hello")])
            .await
            .unwrap();

        // A second process starting against the same database
        let other_sink = SqlSink::new(SinkTarget::default());
        let second = SchemaProvisioner::new(&source, &other_sink)
            .provision()
            .await
            .unwrap();
        assert!(!second.table_created);

        let logs = other_sink.recent_logs(&url, 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message.as_deref(), Some("hello"));
    }
}
