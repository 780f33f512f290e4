//! Error types for the log-shipping pipeline.
//!
//! Startup errors (`ConnectionUnresolved`, `InvalidIdentifier`, `Provisioning`) are fatal and
//! returned from [`crate::pipeline::LogPipeline::start`]. Everything raised while persisting a
//! batch is transient and stays inside the batch processor loop.

use std::time::Duration;

/// Errors raised by the pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The connection source returned nothing usable
    #[error("no sink connection string could be resolved")]
    ConnectionUnresolved,

    /// Schema or table name that cannot be safely used in DDL
    #[error("invalid sink identifier '{name}': expected [A-Za-z_][A-Za-z0-9_]*, at most 63 characters")]
    InvalidIdentifier { name: String },

    /// Connection string with a scheme we have no dialect for
    #[error("unsupported sink url scheme '{url_scheme}' (expected sqlite: or postgres:)")]
    UnsupportedSink { url_scheme: String },

    /// Startup provisioning of the schema or table failed
    #[error("failed to provision log sink: {0}")]
    Provisioning(#[source] sqlx::Error),

    /// Database error while writing a batch
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persistence attempt ran past its deadline
    #[error("persistence attempt timed out after {0:?}")]
    AttemptTimedOut(Duration),

    /// A supervised worker panicked
    #[error("worker '{0}' panicked")]
    WorkerPanicked(String),
}

impl PipelineError {
    /// True for errors that abort startup rather than being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidIdentifier { .. }
                | PipelineError::UnsupportedSink { .. }
                | PipelineError::Provisioning(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(PipelineError::Provisioning(sqlx::Error::PoolClosed).is_fatal());
        assert!(PipelineError::InvalidIdentifier { name: "x y".into() }.is_fatal());
        assert!(!PipelineError::AttemptTimedOut(Duration::from_secs(1)).is_fatal());
        assert!(!PipelineError::Database(sqlx::Error::PoolTimedOut).is_fatal());
    }

    #[test]
    fn test_error_messages() {
        let err = PipelineError::UnsupportedSink {
            url_scheme: "mysql".to_string(),
        };
        assert!(err.to_string().contains("mysql"));
    }
}
