//! Trace-correlated request instrumentation for HTTP services.
//!
//! This crate ties the OpenTelemetry trace and log pipelines to the control
//! flow of individual requests:
//!
//! * [`Telemetry`] builds the span and log pipelines (OTLP over HTTP) once at
//!   startup and owns them until shutdown.
//! * [`wrap`] turns a request handler into an [`InstrumentedHandler`] that
//!   starts or continues a server span for every request.
//! * [`correlate`] derives a [`Logger`] that stamps every event with the active
//!   span's `trace_id`, `span_id` and `trace_flags`.
//! * [`Telemetry::force_flush`] and [`Telemetry::shutdown`] drain both
//!   pipelines within a deadline, so telemetry from short-lived processes is
//!   exported before they exit.
//!
//! # Lifecycle
//!
//! ```no_run
//! use opentelemetry_http_instrumentation::{shutdown_signal, Telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
//!     let config = TelemetryConfig::new("hello").with_env()?;
//!     let telemetry = Telemetry::init(config)?;
//!     telemetry.install()?;
//!     // Covers early returns and panics below.
//!     let _guard = telemetry.shutdown_guard();
//!
//!     // ... serve requests until asked to stop ...
//!     shutdown_signal().await;
//!
//!     if let Err(err) = telemetry.shutdown(telemetry.config().flush_timeout).await {
//!         eprintln!("telemetry shutdown failed: {err}");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Flushing per invocation
//!
//! Serverless platforms may freeze a process as soon as a response is sent.
//! With [`TelemetryConfig::flush_per_invocation`] set (the default), every
//! instrumented request flushes both pipelines before its response is
//! returned, and shutdown still flushes whatever remains.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

mod config;
mod error;
mod handler;
mod logger;
mod shutdown;
mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{
    Protocol, TelemetryConfig, OTEL_EXPORTER_OTLP_ENDPOINT, OTEL_EXPORTER_OTLP_PROTOCOL,
    OTEL_EXPORTER_OTLP_TIMEOUT, OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT, OTEL_FLUSH_PER_INVOCATION,
    OTEL_FLUSH_TIMEOUT, OTEL_FLUSH_TIMEOUT_DEFAULT, OTEL_LOG_STDOUT, OTEL_SERVICE_NAME,
};
pub use error::{ExportError, InitializationError, Signal};
pub use handler::{wrap, InstrumentedHandler, RequestContextExt};
pub use logger::{
    correlate, correlate_current, Correlation, Logger, LOG_TARGET, SPAN_ID_FIELD,
    TRACE_FLAGS_FIELD, TRACE_ID_FIELD,
};
pub use shutdown::{shutdown_signal, ShutdownGuard};
pub use telemetry::{Telemetry, TelemetryBuilder};
