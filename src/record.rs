//! # Log Record Module
//!
//! The immutable value that flows through the pipeline. A record is created by the
//! emitter, pushed to the buffer, copied into a batch, and persisted as one row.
//!
//! ## Column limits
//!
//! Bounded columns are truncated at construction so a record always fits its row:
//!
//! - `category`: 256 characters
//! - `trace_id` / `span_id`: 100 characters
//! - `machine`: 100 characters

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::OnceLock;

pub const MAX_CATEGORY_LEN: usize = 256;
pub const MAX_CORRELATION_ID_LEN: usize = 100;
pub const MAX_MACHINE_LEN: usize = 100;

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Severity of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "Trace",
            LogLevel::Debug => "Debug",
            LogLevel::Information => "Information",
            LogLevel::Warning => "Warning",
            LogLevel::Error => "Error",
            LogLevel::Critical => "Critical",
        }
    }
}

/// Accepts the usual short forms, case-insensitively
impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(level: &str) -> Result<Self, Self::Err> {
        match level.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" | "information" => Ok(LogLevel::Information),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" | "fatal" => Ok(LogLevel::Critical),
            _ => Err(format!(
                "unknown level '{}', expected trace, debug, information, warning, error or critical",
                level
            )),
        }
    }
}

impl From<&tracing::Level> for LogLevel {
    fn from(level: &tracing::Level) -> Self {
        match *level {
            tracing::Level::TRACE => LogLevel::Trace,
            tracing::Level::DEBUG => LogLevel::Debug,
            tracing::Level::INFO => LogLevel::Information,
            tracing::Level::WARN => LogLevel::Warning,
            tracing::Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single structured log line, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    category: String,
    message: String,
    exception: Option<String>,
    trace_id: Option<String>,
    span_id: Option<String>,
    machine: String,
}

impl LogRecord {
    /// Create a record stamped with the current UTC time and this host's name
    pub fn new(level: LogLevel, category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            category: truncate(category.into(), MAX_CATEGORY_LEN),
            message: message.into(),
            exception: None,
            trace_id: None,
            span_id: None,
            machine: machine_name().to_string(),
        }
    }

    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(truncate(trace_id.into(), MAX_CORRELATION_ID_LEN));
        self.span_id = Some(truncate(span_id.into(), MAX_CORRELATION_ID_LEN));
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(truncate(trace_id.into(), MAX_CORRELATION_ID_LEN));
        self
    }

    pub fn with_span_id(mut self, span_id: impl Into<String>) -> Self {
        self.span_id = Some(truncate(span_id.into(), MAX_CORRELATION_ID_LEN));
        self
    }

    pub fn with_machine(mut self, machine: impl Into<String>) -> Self {
        self.machine = truncate(machine.into(), MAX_MACHINE_LEN);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn span_id(&self) -> Option<&str> {
        self.span_id.as_deref()
    }

    pub fn machine(&self) -> &str {
        &self.machine
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Host name of this process, resolved once
pub fn machine_name() -> &'static str {
    static MACHINE: OnceLock<String> = OnceLock::new();
    MACHINE.get_or_init(|| {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        truncate(name, MAX_MACHINE_LEN)
    })
}

fn truncate(mut value: String, max_chars: usize) -> String {
    if let Some((idx, _)) = value.char_indices().nth(max_chars) {
        value.truncate(idx);
    }
    value
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
