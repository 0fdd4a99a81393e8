//! Telemetry bootstrap.
//!
//! [`Telemetry`] owns the trace and log providers for the lifetime of the
//! process. Build it once at startup with [`Telemetry::init`] (OTLP/HTTP
//! exporters) or [`Telemetry::builder`] (any exporter), hand clones of it to
//! request handlers, and shut it down once before exiting.
//!
//! Cloning a `Telemetry` creates a new reference to the same providers, not a
//! new pipeline.
use crate::config::TelemetryConfig;
use crate::error::InitializationError;
use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, Context};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_http::HeaderExtractor;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::logs::{LogExporter, LoggerProviderBuilder, SdkLoggerProvider};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider, SpanExporter, TracerProviderBuilder};
use opentelemetry_sdk::Resource;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

// Process-wide registration happens at most once.
static INSTALLED: AtomicBool = AtomicBool::new(false);

// Events from the exporter stack must not be fed back into the log pipeline.
const OTEL_LAYER_FILTER: &str = "info,hyper=off,h2=off,tonic=off,reqwest=off,opentelemetry=off";
const FMT_LAYER_FILTER: &str = "info,opentelemetry=debug";

/// Handle to the trace and log pipelines of this process.
#[derive(Clone, Debug)]
pub struct Telemetry {
    pub(crate) inner: Arc<TelemetryInner>,
}

#[derive(Debug)]
pub(crate) struct TelemetryInner {
    pub(crate) tracer_provider: SdkTracerProvider,
    pub(crate) logger_provider: SdkLoggerProvider,
    pub(crate) propagator: TextMapCompositePropagator,
    pub(crate) config: TelemetryConfig,
    pub(crate) is_shutdown: AtomicBool,
}

impl Telemetry {
    /// Builds OTLP/HTTP span and log pipelines from `config`.
    ///
    /// Configuration is checked before any exporter is built; a bad endpoint
    /// or an exporter that cannot be constructed is an
    /// [`InitializationError`]. The returned handle is not registered
    /// globally, see [`Telemetry::install`].
    pub fn init(config: TelemetryConfig) -> Result<Self, InitializationError> {
        config.validate()?;

        let mut span_exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_protocol(config.protocol.into())
            .with_timeout(config.export_timeout);
        if let Some(endpoint) = config.signal_endpoint("v1/traces") {
            span_exporter = span_exporter.with_endpoint(endpoint);
        }
        let span_exporter = span_exporter
            .build()
            .map_err(InitializationError::SpanExporter)?;

        let mut log_exporter = opentelemetry_otlp::LogExporter::builder()
            .with_http()
            .with_protocol(config.protocol.into())
            .with_timeout(config.export_timeout);
        if let Some(endpoint) = config.signal_endpoint("v1/logs") {
            log_exporter = log_exporter.with_endpoint(endpoint);
        }
        let log_exporter = log_exporter
            .build()
            .map_err(InitializationError::LogExporter)?;

        Ok(Telemetry::builder()
            .with_config(config)
            .with_batch_span_exporter(span_exporter)
            .with_batch_log_exporter(log_exporter)
            .build())
    }

    /// Creates a builder accepting arbitrary exporters.
    pub fn builder() -> TelemetryBuilder {
        TelemetryBuilder::default()
    }

    /// Registers this pipeline as the process default: global tracer
    /// provider, global propagator and global `tracing` subscriber.
    ///
    /// Only one `install` may succeed per process; later calls return
    /// [`InitializationError::AlreadyInitialized`].
    pub fn install(&self) -> Result<(), InitializationError> {
        if INSTALLED.swap(true, Ordering::SeqCst) {
            return Err(InitializationError::AlreadyInitialized);
        }
        self.subscriber().try_init()?;
        global::set_tracer_provider(self.inner.tracer_provider.clone());
        global::set_text_map_propagator(default_propagator());

        info!(
            name: "Telemetry.Installed",
            service_name = %self.inner.config.service_name,
            flush_per_invocation = self.inner.config.flush_per_invocation,
        );
        Ok(())
    }

    /// A `tracing` subscriber that bridges events into the log pipeline and,
    /// when enabled, prints them to stdout.
    ///
    /// The stdout filter follows `RUST_LOG` when set.
    pub fn subscriber(&self) -> impl Subscriber + Send + Sync + 'static {
        let otel_layer = OpenTelemetryTracingBridge::new(&self.inner.logger_provider)
            .with_filter(EnvFilter::new(OTEL_LAYER_FILTER));

        let fmt_layer = self.inner.config.log_to_stdout.then(|| {
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(FMT_LAYER_FILTER));
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_filter(filter)
        });

        tracing_subscriber::registry().with(otel_layer).with(fmt_layer)
    }

    /// A tracer from this pipeline's provider.
    pub fn tracer(&self, name: impl Into<Cow<'static, str>>) -> SdkTracer {
        self.inner.tracer_provider.tracer(name)
    }

    /// Reads the upstream trace context and baggage from request headers.
    ///
    /// Returns an empty context when no valid `traceparent` is present.
    pub fn extract_context(&self, headers: &http::HeaderMap) -> Context {
        self.inner.propagator.extract(&HeaderExtractor(headers))
    }

    /// The trace provider. Shutting it down directly bypasses
    /// [`Telemetry::shutdown`] bookkeeping.
    pub fn tracer_provider(&self) -> &SdkTracerProvider {
        &self.inner.tracer_provider
    }

    /// The log provider.
    pub fn logger_provider(&self) -> &SdkLoggerProvider {
        &self.inner.logger_provider
    }

    /// The configuration this pipeline was built from.
    pub fn config(&self) -> &TelemetryConfig {
        &self.inner.config
    }
}

fn default_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Builder for [`Telemetry`] with caller-supplied exporters.
#[derive(Debug, Default)]
pub struct TelemetryBuilder {
    config: TelemetryConfig,
    tracer_provider: TracerProviderBuilder,
    logger_provider: LoggerProviderBuilder,
}

impl TelemetryBuilder {
    /// Sets the configuration. Exporter settings in it are ignored by the
    /// builder; flush and logging settings apply.
    pub fn with_config(mut self, config: TelemetryConfig) -> Self {
        self.config = config;
        self
    }

    /// Exports spans in batches from a background thread.
    pub fn with_batch_span_exporter<T: SpanExporter + 'static>(mut self, exporter: T) -> Self {
        self.tracer_provider = self.tracer_provider.with_batch_exporter(exporter);
        self
    }

    /// Exports every span synchronously as it ends.
    pub fn with_simple_span_exporter<T: SpanExporter + 'static>(mut self, exporter: T) -> Self {
        self.tracer_provider = self.tracer_provider.with_simple_exporter(exporter);
        self
    }

    /// Exports log records in batches from a background thread.
    pub fn with_batch_log_exporter<T: LogExporter + 'static>(mut self, exporter: T) -> Self {
        self.logger_provider = self.logger_provider.with_batch_exporter(exporter);
        self
    }

    /// Exports every log record synchronously as it is emitted.
    pub fn with_simple_log_exporter<T: LogExporter + 'static>(mut self, exporter: T) -> Self {
        self.logger_provider = self.logger_provider.with_simple_exporter(exporter);
        self
    }

    /// Builds both providers with a resource carrying the configured
    /// service name.
    pub fn build(self) -> Telemetry {
        let resource = Resource::builder()
            .with_service_name(self.config.service_name.to_string())
            .build();

        Telemetry {
            inner: Arc::new(TelemetryInner {
                tracer_provider: self.tracer_provider.with_resource(resource.clone()).build(),
                logger_provider: self.logger_provider.with_resource(resource).build(),
                propagator: default_propagator(),
                config: self.config,
                is_shutdown: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::trace::TraceContextExt;

    #[test]
    fn init_rejects_bad_endpoint() {
        let config = TelemetryConfig::new("test").with_endpoint("localhost:4318");
        let err = Telemetry::init(config).unwrap_err();
        assert!(matches!(err, InitializationError::InvalidConfig { .. }));
    }

    #[test]
    fn init_builds_otlp_pipelines() {
        let config = TelemetryConfig::new("test")
            .with_endpoint("http://127.0.0.1:4318")
            .with_log_to_stdout(false);
        let telemetry = Telemetry::init(config).unwrap();
        assert_eq!(telemetry.config().service_name, "test");
        let _ = telemetry.tracer_provider().shutdown();
        let _ = telemetry.logger_provider().shutdown();
    }

    #[test]
    fn extract_context_without_headers_is_empty() {
        let telemetry = Telemetry::builder().build();
        let cx = telemetry.extract_context(&http::HeaderMap::new());
        assert!(!cx.span().span_context().is_valid());
    }

    #[test]
    fn extract_context_reads_traceparent_and_baggage() {
        let telemetry = Telemetry::builder().build();
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".parse().unwrap(),
        );
        headers.insert("baggage", "tenant=acme".parse().unwrap());

        let cx = telemetry.extract_context(&headers);
        let span = cx.span();
        let span_context = span.span_context();
        assert!(span_context.is_valid());
        assert!(span_context.is_remote());
        assert_eq!(
            span_context.trace_id().to_string(),
            "4bf92f3577b34da6a3ce929d0e0e4736"
        );
        assert_eq!(
            cx.baggage().get("tenant").map(|value| value.to_string()),
            Some("acme".to_string())
        );
    }
}
