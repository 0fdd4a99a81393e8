//! Errors returned by the telemetry lifecycle.
//!
//! Bootstrap failures are [`InitializationError`]s and are meant to abort
//! startup. Flush and shutdown failures are [`ExportError`]s: they are
//! reported to the caller and never affect request handling.
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_sdk::error::OTelSdkError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Telemetry signal a pipeline carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Signal {
    /// Spans.
    Traces,
    /// Log records.
    Logs,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Traces => f.write_str("traces"),
            Signal::Logs => f.write_str("logs"),
        }
    }
}

/// Errors that prevent the telemetry pipelines from starting.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InitializationError {
    /// A configuration value is missing or malformed.
    #[error("invalid configuration {name}: {reason}")]
    InvalidConfig {
        /// The configuration name, usually the environment variable.
        name: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The OTLP span exporter could not be built.
    #[error("failed to build span exporter: {0}")]
    SpanExporter(#[source] ExporterBuildError),

    /// The OTLP log exporter could not be built.
    #[error("failed to build log exporter: {0}")]
    LogExporter(#[source] ExporterBuildError),

    /// The global `tracing` subscriber could not be installed.
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),

    /// Process-wide telemetry was already installed.
    #[error("telemetry is already installed for this process")]
    AlreadyInitialized,
}

/// Errors returned by force flush and shutdown.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExportError {
    /// Shutdown already ran; the pipelines no longer accept work.
    #[error("telemetry is already shut down")]
    AlreadyShutdown,

    /// The pipeline did not drain before the deadline.
    #[error("{signal} export did not complete within {deadline:?}")]
    Timeout {
        /// The pipeline that timed out.
        signal: Signal,
        /// The deadline that elapsed.
        deadline: Duration,
    },

    /// The SDK reported a failure while exporting.
    #[error("{signal} export failed: {source}")]
    Failed {
        /// The pipeline that failed.
        signal: Signal,
        /// The SDK error.
        #[source]
        source: OTelSdkError,
    },

    /// The blocking task running the export was cancelled or panicked.
    #[error("{signal} export task aborted: {reason}")]
    Join {
        /// The pipeline whose task aborted.
        signal: Signal,
        /// Description of the join failure.
        reason: String,
    },

    /// Both pipelines failed.
    #[error("{}", join_errors(.0))]
    Multiple(Vec<ExportError>),
}

impl ExportError {
    pub(crate) fn from_sdk(signal: Signal, err: OTelSdkError) -> Self {
        match err {
            OTelSdkError::AlreadyShutdown => ExportError::AlreadyShutdown,
            OTelSdkError::Timeout(deadline) => ExportError::Timeout { signal, deadline },
            source => ExportError::Failed { signal, source },
        }
    }

    /// Folds per-signal results into one result.
    pub(crate) fn collect(results: impl IntoIterator<Item = Result<(), ExportError>>) -> Result<(), ExportError> {
        let mut errors: Vec<ExportError> = results.into_iter().filter_map(Result::err).collect();
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ExportError::Multiple(errors)),
        }
    }

    /// Returns true if the error only reports an expired deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            ExportError::Timeout { .. } => true,
            ExportError::Multiple(errors) => errors.iter().all(ExportError::is_timeout),
            _ => false,
        }
    }
}

fn join_errors(errors: &[ExportError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
