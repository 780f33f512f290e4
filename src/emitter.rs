//! # Record Emitter Module
//!
//! The entry points the rest of a process uses to hand records to the pipeline:
//!
//! - [`LogEmitter`]: a cheap, cloneable handle with a non-blocking, infallible `emit`.
//! - [`SqlLogLayer`]: a `tracing_subscriber` layer that turns every `tracing` event into
//!   a [`LogRecord`] and emits it, so ordinary `info!`/`error!` calls reach the sink.
//!
//! ## Event mapping
//!
//! | Record field | Source |
//! |---|---|
//! | `level` | event level |
//! | `category` | event target |
//! | `message` | `message` field, followed by `key=value` for other fields |
//! | `exception` | an `error` or `exception` field |
//! | `trace_id` | a `trace_id` field |
//! | `span_id` | id of the span the event was recorded in |
//!
//! Events from the pipeline's own components and from `sqlx` are not shipped, so a
//! failing sink can't feed its own error logs back into the buffer.

use crate::buffer::LogBuffer;
use crate::record::{LogLevel, LogRecord};
use std::fmt::Write;
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Targets whose events never enter the pipeline
const INTERNAL_TARGETS: [&str; 8] = [
    "logvault::buffer",
    "logvault::database",
    "logvault::pipeline",
    "logvault::processor",
    "logvault::provision",
    "logvault::shutdown",
    "logvault::worker",
    "sqlx",
];

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Handle for pushing records into the pipeline
#[derive(Clone)]
pub struct LogEmitter {
    buffer: Arc<LogBuffer>,
}

impl LogEmitter {
    pub fn new(buffer: Arc<LogBuffer>) -> Self {
        Self { buffer }
    }

    /// Hand a record to the pipeline. Never blocks and never fails.
    pub fn emit(&self, record: LogRecord) {
        self.buffer.push(record);
    }

    /// Build and emit a record stamped with the current time and host
    pub fn log(&self, level: LogLevel, category: impl Into<String>, message: impl Into<String>) {
        self.emit(LogRecord::new(level, category, message));
    }

    /// Records emitted but not yet drained by the processor
    pub fn pending(&self) -> usize {
        self.buffer.depth()
    }
}

/// `tracing` layer that ships events to the pipeline
#[derive(Clone)]
pub struct SqlLogLayer {
    emitter: LogEmitter,
}

impl SqlLogLayer {
    pub fn new(emitter: LogEmitter) -> Self {
        Self { emitter }
    }
}

impl<S> Layer<S> for SqlLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if is_internal(metadata.target()) {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);

        let mut record = LogRecord::new(
            LogLevel::from(metadata.level()),
            metadata.target(),
            fields.render(),
        );
        if let Some(exception) = fields.exception {
            record = record.with_exception(exception);
        }
        if let Some(trace_id) = fields.trace_id {
            record = record.with_trace_id(trace_id);
        }
        if let Some(span) = ctx.event_span(event) {
            record = record.with_span_id(format!("{:016x}", span.id().into_u64()));
        }

        self.emitter.emit(record);
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    exception: Option<String>,
    trace_id: Option<String>,
    extra: Vec<(&'static str, String)>,
}

impl EventFields {
    fn store(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "error" | "exception" => self.exception = Some(value),
            "trace_id" => self.trace_id = Some(value),
            name => self.extra.push((name, value)),
        }
    }

    fn render(&self) -> String {
        let mut rendered = self.message.clone().unwrap_or_default();
        for (name, value) in &self.extra {
            if !rendered.is_empty() {
                rendered.push(' ');
            }
            let _ = write!(rendered, "{}={}", name, value);
        }
        rendered
    }
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.store(field, value.to_string());
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.store(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.store(field, format!("{:?}", value));
    }
}

fn is_internal(target: &str) -> bool {
    INTERNAL_TARGETS.iter().any(|internal| {
        target == *internal
            || target
                .strip_prefix(internal)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
