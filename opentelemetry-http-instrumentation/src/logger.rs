//! Span-aware logging.
//!
//! A [`Logger`] emits `tracing` events. [`correlate`] derives, from the
//! request's OpenTelemetry [`Context`], a logger whose every event carries the
//! active span's `trace_id`, `span_id` and `trace_flags` so that log lines can
//! be joined with spans in the backend.
//!
//! ```
//! use opentelemetry::Context;
//! use opentelemetry_http_instrumentation::{correlate, Logger};
//!
//! let base = Logger::new("greeter");
//! // No active span: the base logger is handed back untouched.
//! let logger = correlate(&Context::new(), &base);
//! assert!(logger.correlation().is_none());
//! logger.info("In hello handler");
//! ```
use opentelemetry::trace::{SpanContext, TraceContextExt};
use opentelemetry::Context;
use std::borrow::Cow;
use std::fmt;
use tracing::level_filters::LevelFilter;
use tracing::Level;

/// Target of every event emitted through a [`Logger`].
pub const LOG_TARGET: &str = "request";
/// Field name carrying the trace id.
pub const TRACE_ID_FIELD: &str = "trace_id";
/// Field name carrying the span id.
pub const SPAN_ID_FIELD: &str = "span_id";
/// Field name carrying the trace flags.
pub const TRACE_FLAGS_FIELD: &str = "trace_flags";

/// Trace identifiers copied from a valid [`SpanContext`], in their canonical
/// lowercase hex form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Correlation {
    trace_id: String,
    span_id: String,
    trace_flags: String,
}

impl Correlation {
    /// Returns `None` when `span_context` is not valid.
    pub fn from_span_context(span_context: &SpanContext) -> Option<Self> {
        if !span_context.is_valid() {
            return None;
        }
        Some(Correlation {
            trace_id: span_context.trace_id().to_string(),
            span_id: span_context.span_id().to_string(),
            trace_flags: format!("{:02x}", span_context.trace_flags().to_u8()),
        })
    }

    /// 32 hex characters.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// 16 hex characters.
    pub fn span_id(&self) -> &str {
        &self.span_id
    }

    /// `01` when sampled, `00` otherwise.
    pub fn trace_flags(&self) -> &str {
        &self.trace_flags
    }
}

macro_rules! emit {
    ($logger:expr, $level:expr, $message:expr) => {
        match &$logger.correlation {
            Some(correlation) => tracing::event!(
                target: LOG_TARGET,
                $level,
                logger = %$logger.name,
                trace_id = %correlation.trace_id,
                span_id = %correlation.span_id,
                trace_flags = %correlation.trace_flags,
                message = %$message,
            ),
            None => tracing::event!(
                target: LOG_TARGET,
                $level,
                logger = %$logger.name,
                message = %$message,
            ),
        }
    };
}

/// A named logger writing to the installed `tracing` subscriber.
///
/// Events below [`Logger::max_level`] are dropped before reaching the
/// subscriber; the subscriber's own filters still apply on top.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Logger {
    name: Cow<'static, str>,
    max_level: LevelFilter,
    correlation: Option<Correlation>,
}

impl Logger {
    /// Creates a logger with no correlation fields, accepting every level.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Logger {
            name: name.into(),
            max_level: LevelFilter::TRACE,
            correlation: None,
        }
    }

    /// Sets the most verbose level this logger emits.
    pub fn with_max_level(mut self, max_level: LevelFilter) -> Self {
        self.max_level = max_level;
        self
    }

    /// Returns a copy of this logger carrying `correlation`.
    pub fn with_correlation(&self, correlation: Correlation) -> Self {
        Logger {
            correlation: Some(correlation),
            ..self.clone()
        }
    }

    /// The name recorded as the `logger` field of every event.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The most verbose level this logger emits.
    pub fn max_level(&self) -> LevelFilter {
        self.max_level
    }

    /// Trace identifiers attached to every event, if any.
    pub fn correlation(&self) -> Option<&Correlation> {
        self.correlation.as_ref()
    }

    /// Whether events at `level` pass this logger's threshold.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.max_level
    }

    /// Emits `message` at `DEBUG`.
    pub fn debug(&self, message: impl fmt::Display) {
        self.log(Level::DEBUG, &message);
    }

    /// Emits `message` at `INFO`.
    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, &message);
    }

    /// Emits `message` at `WARN`.
    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::WARN, &message);
    }

    /// Emits `message` at `ERROR`.
    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::ERROR, &message);
    }

    /// Emits `message` at `level`.
    pub fn log(&self, level: Level, message: &dyn fmt::Display) {
        if !self.enabled(level) {
            return;
        }
        // `tracing` needs the level as a constant at each callsite.
        match level {
            Level::ERROR => emit!(self, Level::ERROR, message),
            Level::WARN => emit!(self, Level::WARN, message),
            Level::INFO => emit!(self, Level::INFO, message),
            Level::DEBUG => emit!(self, Level::DEBUG, message),
            _ => emit!(self, Level::TRACE, message),
        }
    }
}

/// Derives a logger correlated with the span active in `cx`.
///
/// When `cx` carries no valid span, `base` itself is returned borrowed, with
/// nothing allocated and no field added. Otherwise an owned copy of `base`
/// with the span's identifiers is returned. `base` is never modified.
pub fn correlate<'a>(cx: &Context, base: &'a Logger) -> Cow<'a, Logger> {
    let span = cx.span();
    match Correlation::from_span_context(span.span_context()) {
        Some(correlation) => Cow::Owned(base.with_correlation(correlation)),
        None => Cow::Borrowed(base),
    }
}

/// Like [`correlate`], using [`Context::current`].
pub fn correlate_current(base: &Logger) -> Cow<'_, Logger> {
    correlate(&Context::current(), base)
}
