//! Flush and shutdown of the telemetry pipelines.
//!
//! Both providers buffer in the background. [`Telemetry::force_flush`] drains
//! them mid-lifetime (typically at the end of a serverless invocation, before
//! the platform may freeze the process) and [`Telemetry::shutdown`] drains and
//! releases them once at process end. Provider calls block, so they run on
//! tokio's blocking pool and are raced against the caller's deadline.
//!
//! A deadline that elapses is reported as [`ExportError::Timeout`]; trailing
//! telemetry is dropped rather than holding the process open.
use crate::error::{ExportError, Signal};
use crate::telemetry::Telemetry;
use opentelemetry_sdk::error::OTelSdkResult;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, info, warn};

impl Telemetry {
    /// Exports everything buffered so far in both pipelines, waiting at most
    /// `deadline`.
    ///
    /// Spans and log records recorded before the call are exported when this
    /// returns `Ok`. Records made concurrently may or may not be included.
    pub async fn force_flush(&self, deadline: Duration) -> Result<(), ExportError> {
        if self.is_shutdown() {
            return Err(ExportError::AlreadyShutdown);
        }
        let tracer_provider = self.inner.tracer_provider.clone();
        let logger_provider = self.inner.logger_provider.clone();

        let (traces, logs) = tokio::join!(
            run_blocking(Signal::Traces, deadline, move || tracer_provider.force_flush()),
            run_blocking(Signal::Logs, deadline, move || logger_provider.force_flush()),
        );
        let result = ExportError::collect([traces, logs]);
        if let Err(err) = &result {
            debug!(name: "Telemetry.ForceFlushFailed", error = %err);
        }
        result
    }

    /// Flushes and shuts down both pipelines, waiting at most `deadline` for
    /// each.
    ///
    /// Only the first call does any work. Later calls return
    /// [`ExportError::AlreadyShutdown`]. After shutdown, spans and log
    /// records are silently dropped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ExportError> {
        if self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(ExportError::AlreadyShutdown);
        }
        let tracer_provider = self.inner.tracer_provider.clone();
        let logger_provider = self.inner.logger_provider.clone();

        let (traces, logs) = tokio::join!(
            run_blocking(Signal::Traces, deadline, move || {
                tracer_provider.shutdown_with_timeout(deadline)
            }),
            run_blocking(Signal::Logs, deadline, move || {
                logger_provider.shutdown_with_timeout(deadline)
            }),
        );
        let result = ExportError::collect([traces, logs]);
        log_shutdown(&result);
        result
    }

    /// Blocking variant of [`Telemetry::shutdown`] for contexts without an
    /// async runtime, such as `Drop`.
    pub fn shutdown_blocking(&self, deadline: Duration) -> Result<(), ExportError> {
        if self.inner.is_shutdown.swap(true, Ordering::SeqCst) {
            return Err(ExportError::AlreadyShutdown);
        }
        let traces = self
            .inner
            .tracer_provider
            .shutdown_with_timeout(deadline)
            .map_err(|err| ExportError::from_sdk(Signal::Traces, err));
        let logs = self
            .inner
            .logger_provider
            .shutdown_with_timeout(deadline)
            .map_err(|err| ExportError::from_sdk(Signal::Logs, err));
        let result = ExportError::collect([traces, logs]);
        log_shutdown(&result);
        result
    }

    /// Whether [`Telemetry::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown.load(Ordering::SeqCst)
    }

    /// Returns a guard that shuts this pipeline down when dropped, unless it
    /// was already shut down.
    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            telemetry: self.clone(),
        }
    }
}

fn log_shutdown(result: &Result<(), ExportError>) {
    match result {
        Ok(()) => info!(name: "Telemetry.ShutdownComplete", message = "telemetry shut down"),
        Err(err) => warn!(name: "Telemetry.ShutdownFailed", error = %err),
    }
}

async fn run_blocking<F>(signal: Signal, deadline: Duration, f: F) -> Result<(), ExportError>
where
    F: FnOnce() -> OTelSdkResult + Send + 'static,
{
    match tokio::time::timeout(deadline, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(err))) => Err(ExportError::from_sdk(signal, err)),
        Ok(Err(join_error)) => Err(ExportError::Join {
            signal,
            reason: join_error.to_string(),
        }),
        Err(_elapsed) => Err(ExportError::Timeout { signal, deadline }),
    }
}

/// Shuts the pipelines down on drop.
///
/// Keep one alive for the whole of `main` so that early returns and panics
/// unwinding out of `main` still export buffered telemetry. An explicit
/// [`Telemetry::shutdown`] before the guard drops makes the guard a no-op.
#[derive(Debug)]
#[must_use = "the pipelines are shut down when the guard is dropped"]
pub struct ShutdownGuard {
    telemetry: Telemetry,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if self.telemetry.is_shutdown() {
            return;
        }
        let deadline = self.telemetry.config().flush_timeout;
        let _ = self.telemetry.shutdown_blocking(deadline);
    }
}

/// Completes when the process is asked to terminate: Ctrl-C, or SIGTERM on
/// unix (the signal serverless platforms send before reclaiming an
/// instance).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(name: "ShutdownSignal.CtrlCUnavailable", error = %err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(name: "ShutdownSignal.SigtermUnavailable", error = %err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(name: "ShutdownSignal.Received", signal = "ctrl_c"),
        _ = terminate => info!(name: "ShutdownSignal.Received", signal = "terminate"),
    }
}
