//! Telemetry configuration.
//!
//! [`TelemetryConfig`] collects everything the bootstrap needs to build the
//! trace and log pipelines. Values can be set programmatically or read from
//! the standard `OTEL_*` environment variables with
//! [`TelemetryConfig::with_env`]. Programmatic values set after `with_env`
//! override the environment.

use crate::error::InitializationError;
use std::borrow::Cow;
use std::str::FromStr;
use std::time::Duration;

/// Service name reported in the telemetry resource.
pub const OTEL_SERVICE_NAME: &str = "OTEL_SERVICE_NAME";
/// Base OTLP/HTTP endpoint. `/v1/traces` and `/v1/logs` are appended per signal.
pub const OTEL_EXPORTER_OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";
/// Either `http/protobuf` or `http/json`.
pub const OTEL_EXPORTER_OTLP_PROTOCOL: &str = "OTEL_EXPORTER_OTLP_PROTOCOL";
/// Max waiting time for the backend to accept a batch, in milliseconds.
pub const OTEL_EXPORTER_OTLP_TIMEOUT: &str = "OTEL_EXPORTER_OTLP_TIMEOUT";
/// Deadline for force flush and shutdown, in milliseconds.
pub const OTEL_FLUSH_TIMEOUT: &str = "OTEL_FLUSH_TIMEOUT";
/// Whether every instrumented request flushes both pipelines before returning.
pub const OTEL_FLUSH_PER_INVOCATION: &str = "OTEL_FLUSH_PER_INVOCATION";
/// Whether log events are also written to stdout.
pub const OTEL_LOG_STDOUT: &str = "OTEL_LOG_STDOUT";

/// Default exporter timeout.
pub const OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT: Duration = Duration::from_millis(10_000);
/// Default flush and shutdown deadline.
pub const OTEL_FLUSH_TIMEOUT_DEFAULT: Duration = Duration::from_millis(5_000);

const DEFAULT_SERVICE_NAME: &str = "unknown_service";

/// Wire encoding used by the OTLP/HTTP exporters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protocol {
    /// Binary protobuf payloads (`http/protobuf`).
    #[default]
    HttpBinary,
    /// JSON encoded protobuf payloads (`http/json`).
    HttpJson,
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "http/protobuf" => Ok(Protocol::HttpBinary),
            "http/json" => Ok(Protocol::HttpJson),
            other => Err(format!(
                "unsupported protocol '{other}', expected 'http/protobuf' or 'http/json'"
            )),
        }
    }
}

impl From<Protocol> for opentelemetry_otlp::Protocol {
    fn from(protocol: Protocol) -> Self {
        match protocol {
            Protocol::HttpBinary => opentelemetry_otlp::Protocol::HttpBinary,
            Protocol::HttpJson => opentelemetry_otlp::Protocol::HttpJson,
        }
    }
}

/// Configuration for [`Telemetry::init`](crate::Telemetry::init).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Name recorded as `service.name` on every span and log record.
    pub service_name: Cow<'static, str>,
    /// Base endpoint of the collector. `None` lets the exporter fall back to
    /// its own environment handling and defaults.
    pub endpoint: Option<String>,
    /// OTLP/HTTP encoding.
    pub protocol: Protocol,
    /// Per-batch export timeout.
    pub export_timeout: Duration,
    /// Deadline applied to force flush and shutdown.
    pub flush_timeout: Duration,
    /// Flush both pipelines at the end of every instrumented request.
    pub flush_per_invocation: bool,
    /// Also write log events to stdout.
    pub log_to_stdout: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            service_name: Cow::Borrowed(DEFAULT_SERVICE_NAME),
            endpoint: None,
            protocol: Protocol::default(),
            export_timeout: OTEL_EXPORTER_OTLP_TIMEOUT_DEFAULT,
            flush_timeout: OTEL_FLUSH_TIMEOUT_DEFAULT,
            flush_per_invocation: true,
            log_to_stdout: true,
        }
    }
}

impl TelemetryConfig {
    /// Creates a default configuration with the given service name.
    pub fn new(service_name: impl Into<Cow<'static, str>>) -> Self {
        TelemetryConfig {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Reads configuration from the environment, keeping `self` for unset
    /// variables.
    ///
    /// Returns [`InitializationError::InvalidConfig`] for values that are set
    /// but cannot be parsed.
    pub fn with_env(mut self) -> Result<Self, InitializationError> {
        if let Some(name) = env_var(OTEL_SERVICE_NAME) {
            self.service_name = Cow::Owned(name);
        }
        if let Some(endpoint) = env_var(OTEL_EXPORTER_OTLP_ENDPOINT) {
            self.endpoint = Some(endpoint);
        }
        if let Some(protocol) = env_var(OTEL_EXPORTER_OTLP_PROTOCOL) {
            self.protocol = protocol
                .parse()
                .map_err(|reason| invalid(OTEL_EXPORTER_OTLP_PROTOCOL, reason))?;
        }
        if let Some(timeout) = env_var(OTEL_EXPORTER_OTLP_TIMEOUT) {
            self.export_timeout = parse_millis(OTEL_EXPORTER_OTLP_TIMEOUT, &timeout)?;
        }
        if let Some(timeout) = env_var(OTEL_FLUSH_TIMEOUT) {
            self.flush_timeout = parse_millis(OTEL_FLUSH_TIMEOUT, &timeout)?;
        }
        if let Some(flag) = env_var(OTEL_FLUSH_PER_INVOCATION) {
            self.flush_per_invocation = parse_bool(OTEL_FLUSH_PER_INVOCATION, &flag)?;
        }
        if let Some(flag) = env_var(OTEL_LOG_STDOUT) {
            self.log_to_stdout = parse_bool(OTEL_LOG_STDOUT, &flag)?;
        }
        Ok(self)
    }

    /// Sets the collector base endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the OTLP/HTTP encoding.
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Sets the force flush and shutdown deadline.
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }

    /// Enables or disables the flush at the end of every request.
    pub fn with_flush_per_invocation(mut self, enabled: bool) -> Self {
        self.flush_per_invocation = enabled;
        self
    }

    /// Enables or disables the stdout log layer.
    pub fn with_log_to_stdout(mut self, enabled: bool) -> Self {
        self.log_to_stdout = enabled;
        self
    }

    /// Checks the endpoint eagerly so that a misconfigured collector address
    /// fails at startup rather than at the first export.
    pub(crate) fn validate(&self) -> Result<(), InitializationError> {
        if self.service_name.trim().is_empty() {
            return Err(invalid(OTEL_SERVICE_NAME, "service name must not be empty"));
        }
        if let Some(endpoint) = &self.endpoint {
            let uri: http::Uri = endpoint
                .parse()
                .map_err(|err: http::uri::InvalidUri| invalid(OTEL_EXPORTER_OTLP_ENDPOINT, err))?;
            match uri.scheme_str() {
                Some("http") | Some("https") if uri.host().is_some() => {}
                _ => {
                    return Err(invalid(
                        OTEL_EXPORTER_OTLP_ENDPOINT,
                        format!("'{endpoint}' is not an absolute http(s) URL"),
                    ))
                }
            }
        }
        if self.flush_timeout.is_zero() {
            return Err(invalid(OTEL_FLUSH_TIMEOUT, "flush timeout must be positive"));
        }
        Ok(())
    }

    /// Full endpoint for one signal, e.g. `http://collector:4318/v1/traces`.
    pub(crate) fn signal_endpoint(&self, path: &str) -> Option<String> {
        self.endpoint
            .as_ref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), path))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_millis(name: &str, value: &str) -> Result<Duration, InitializationError> {
    value
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|err| invalid(name, format!("'{value}' is not a number of milliseconds: {err}")))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, InitializationError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(name, format!("'{value}' is not a boolean"))),
    }
}

fn invalid(name: &str, reason: impl ToString) -> InitializationError {
    InitializationError::InvalidConfig {
        name: name.to_owned(),
        reason: reason.to_string(),
    }
}
