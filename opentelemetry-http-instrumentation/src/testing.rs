//! Test helpers: exporters and a `tracing` layer that record in memory.
//!
//! Enabled with the `testing` feature. Unlike the SDK's in-memory exporters,
//! the recording exporters keep their data across shutdown so tests can
//! check what shutdown drained.
use crate::config::TelemetryConfig;
use crate::telemetry::Telemetry;
use opentelemetry::logs::AnyValue;
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::logs::{LogBatch, LogExporter, SdkLogRecord};
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

/// One recorded `tracing` event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Level of the event.
    pub level: Level,
    /// Target of the event.
    pub target: String,
    /// Every recorded field, formatted as text.
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    /// Value of `name`, if recorded.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// The `message` field.
    pub fn message(&self) -> Option<&str> {
        self.field("message")
    }
}

/// Shared store of recorded events, usable as a [`Layer`].
#[derive(Clone, Debug, Default)]
pub struct CapturedEvents {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedEvents {
    /// Snapshot of every event recorded so far.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// Events whose `message` equals `message`.
    pub fn with_message(&self, message: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|event| event.message() == Some(message))
            .collect()
    }

    /// A registry with only this layer installed.
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        tracing_subscriber::registry().with(self.clone())
    }
}

struct FieldVisitor<'a> {
    fields: &'a mut HashMap<String, String>,
}

impl Visit for FieldVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_owned(), value.to_owned());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields.insert(field.name().to_owned(), format!("{value:?}"));
    }
}

impl<S: Subscriber> Layer<S> for CapturedEvents {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut captured = CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            fields: HashMap::new(),
        };
        event.record(&mut FieldVisitor {
            fields: &mut captured.fields,
        });
        if let Ok(mut events) = self.events.lock() {
            events.push(captured);
        }
    }
}

/// Span exporter storing every exported span.
#[derive(Clone, Debug, Default)]
pub struct RecordingSpanExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl RecordingSpanExporter {
    /// Every span exported so far.
    pub fn spans(&self) -> Vec<SpanData> {
        self.spans.lock().map(|spans| spans.clone()).unwrap_or_default()
    }
}

impl SpanExporter for RecordingSpanExporter {
    async fn export(&self, batch: Vec<SpanData>) -> OTelSdkResult {
        self.spans
            .lock()
            .map(|mut spans| spans.extend(batch))
            .map_err(|err| OTelSdkError::InternalFailure(format!("Failed to lock spans: {err}")))
    }
}

/// The parts of an exported log record tests look at.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedLog {
    /// The record body, usually the event message.
    pub body: Option<String>,
    /// Trace id the SDK attached from the active context.
    pub trace_id: Option<TraceId>,
    /// Span id the SDK attached from the active context.
    pub span_id: Option<SpanId>,
    /// Attributes formatted as text.
    pub attributes: HashMap<String, String>,
}

impl RecordedLog {
    fn from_record(record: &SdkLogRecord) -> Self {
        let trace_context = record.trace_context();
        RecordedLog {
            body: record.body().map(any_value_to_string),
            trace_id: trace_context.map(|cx| cx.trace_id),
            span_id: trace_context.map(|cx| cx.span_id),
            attributes: record
                .attributes_iter()
                .map(|(key, value)| (key.as_str().to_owned(), any_value_to_string(value)))
                .collect(),
        }
    }

    /// Value of attribute `key`, if present.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

fn any_value_to_string(value: &AnyValue) -> String {
    match value {
        AnyValue::String(value) => value.as_str().to_owned(),
        AnyValue::Int(value) => value.to_string(),
        AnyValue::Double(value) => value.to_string(),
        AnyValue::Boolean(value) => value.to_string(),
        other => format!("{other:?}"),
    }
}

/// Log exporter storing every exported record.
#[derive(Clone, Debug, Default)]
pub struct RecordingLogExporter {
    logs: Arc<Mutex<Vec<RecordedLog>>>,
}

impl RecordingLogExporter {
    /// Every record exported so far.
    pub fn logs(&self) -> Vec<RecordedLog> {
        self.logs.lock().map(|logs| logs.clone()).unwrap_or_default()
    }
}

impl LogExporter for RecordingLogExporter {
    async fn export(&self, batch: LogBatch<'_>) -> OTelSdkResult {
        let recorded: Vec<RecordedLog> = batch
            .iter()
            .map(|(record, _scope)| RecordedLog::from_record(record))
            .collect();
        self.logs
            .lock()
            .map(|mut logs| logs.extend(recorded))
            .map_err(|err| OTelSdkError::InternalFailure(format!("Failed to lock logs: {err}")))
    }
}

/// A [`Telemetry`] wired to recording exporters.
#[derive(Debug)]
pub struct InMemoryPipeline {
    /// The pipeline under test.
    pub telemetry: Telemetry,
    /// Receives every exported span.
    pub span_exporter: RecordingSpanExporter,
    /// Receives every exported log record.
    pub log_exporter: RecordingLogExporter,
}

impl InMemoryPipeline {
    /// Exports each span and log record as soon as it is finished.
    pub fn simple(config: TelemetryConfig) -> Self {
        let span_exporter = RecordingSpanExporter::default();
        let log_exporter = RecordingLogExporter::default();
        let telemetry = Telemetry::builder()
            .with_config(config)
            .with_simple_span_exporter(span_exporter.clone())
            .with_simple_log_exporter(log_exporter.clone())
            .build();
        InMemoryPipeline {
            telemetry,
            span_exporter,
            log_exporter,
        }
    }

    /// Buffers spans and log records until a flush, as production does.
    pub fn batched(config: TelemetryConfig) -> Self {
        let span_exporter = RecordingSpanExporter::default();
        let log_exporter = RecordingLogExporter::default();
        let telemetry = Telemetry::builder()
            .with_config(config)
            .with_batch_span_exporter(span_exporter.clone())
            .with_batch_log_exporter(log_exporter.clone())
            .build();
        InMemoryPipeline {
            telemetry,
            span_exporter,
            log_exporter,
        }
    }

    /// Spans exported so far.
    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.span_exporter.spans()
    }

    /// Log records exported so far.
    pub fn emitted_logs(&self) -> Vec<RecordedLog> {
        self.log_exporter.logs()
    }
}
