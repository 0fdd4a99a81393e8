//! The HTTP side of the greeter: route handling, the accept loop and the
//! process lifecycle shared by both binaries.
use crate::greeting::{self, DecodeError};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt as _;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use opentelemetry::trace::{Span as _, SpanKind, Tracer as _};
use opentelemetry::KeyValue;
use opentelemetry_http_instrumentation::{
    correlate, shutdown_signal, wrap, InstrumentedHandler, Logger, RequestContextExt, Telemetry,
    TelemetryConfig,
};
use opentelemetry_sdk::trace::SdkTracer;
use std::borrow::Cow;
use std::convert::Infallible;
use std::error::Error;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Port variable of the self-hosted server.
pub const PORT: &str = "PORT";
/// Port variable set by serverless custom-handler hosts.
pub const FUNCTIONS_CUSTOMHANDLER_PORT: &str = "FUNCTIONS_CUSTOMHANDLER_PORT";
/// Port used when the variant's port variable is unset.
pub const DEFAULT_PORT: u16 = 8080;

/// Name of the span started for every request.
pub const SPAN_NAME: &str = "hello";
/// Name of the child span around composing the query greeting.
pub const COMPOSE_SPAN_NAME: &str = "compose_greeting";

/// Largest JSON body read; larger bodies get the default greeting.
pub const MAX_BODY_BYTES: usize = 64 * 1024;
/// How long open connections may keep running once accepting has stopped.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const TRACER_NAME: &str = "greeter";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Response type of every greeter route.
pub type GreeterResponse = Response<Full<Bytes>>;

/// Deployment flavour of the greeter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Long-running server: `GET /hello?name=...`.
    Server,
    /// Serverless custom handler: `POST /api/hello` with a JSON body.
    Function,
}

impl Variant {
    /// The single route this variant answers.
    pub fn route(self) -> &'static str {
        match self {
            Variant::Server => "/hello",
            Variant::Function => "/api/hello",
        }
    }

    /// The only method accepted on [`Variant::route`].
    pub fn method(self) -> Method {
        match self {
            Variant::Server => Method::GET,
            Variant::Function => Method::POST,
        }
    }

    fn allow(self) -> HeaderValue {
        match self {
            Variant::Server => HeaderValue::from_static("GET"),
            Variant::Function => HeaderValue::from_static("POST"),
        }
    }

    /// Environment variable holding the listen port.
    pub fn port_var(self) -> &'static str {
        match self {
            Variant::Server => PORT,
            Variant::Function => FUNCTIONS_CUSTOMHANDLER_PORT,
        }
    }

    /// Default `service.name`, overridable with `OTEL_SERVICE_NAME`.
    pub fn service_name(self) -> &'static str {
        match self {
            Variant::Server => "hello-server",
            Variant::Function => "hello-function",
        }
    }

    /// Telemetry defaults for this variant, flushing at the end of every
    /// request.
    pub fn telemetry_config(self) -> TelemetryConfig {
        TelemetryConfig::new(self.service_name())
    }
}

/// Errors reading [`ServerConfig`] from the environment.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// The port variable is set but is not a valid port number.
    #[error("invalid value '{value}' for {name}: expected a port number")]
    InvalidPort {
        /// The offending variable.
        name: &'static str,
        /// Its value.
        value: String,
    },
}

/// Where and what the greeter serves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP port, bound on all interfaces.
    pub port: u16,
    /// The single route answered.
    pub route: Cow<'static, str>,
    /// Deployment flavour.
    pub variant: Variant,
}

impl ServerConfig {
    /// Defaults for `variant`: port 8080 and the variant's route.
    pub fn new(variant: Variant) -> Self {
        ServerConfig {
            port: DEFAULT_PORT,
            route: Cow::Borrowed(variant.route()),
            variant,
        }
    }

    /// Defaults for `variant`, with the port read from the variant's port
    /// variable when set.
    pub fn from_env(variant: Variant) -> Result<Self, ConfigError> {
        let mut config = ServerConfig::new(variant);
        let name = variant.port_var();
        if let Some(value) = std::env::var(name).ok().filter(|value| !value.trim().is_empty()) {
            config.port = value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort { name, value })?;
        }
        Ok(config)
    }

    /// Sets the port; `0` asks the OS for a free one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// The listen address: every interface, on [`ServerConfig::port`].
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }
}

/// Answers requests for one [`ServerConfig`]. Anything off the route is
/// a 404, a wrong method on it a 405.
#[derive(Debug)]
pub struct Greeter {
    config: ServerConfig,
    logger: Logger,
    tracer: SdkTracer,
}

impl Greeter {
    /// Creates a greeter whose sub-operation spans come from `telemetry`.
    pub fn new(config: ServerConfig, telemetry: &Telemetry) -> Self {
        Greeter {
            logger: Logger::new(config.variant.service_name()),
            tracer: telemetry.tracer(TRACER_NAME),
            config,
        }
    }

    /// What this greeter serves.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Produces the response for `req`. Never fails: undecodable input falls
    /// back to the default greeting.
    pub async fn respond<B>(&self, req: Request<B>) -> Result<GreeterResponse, Infallible>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn Error + Send + Sync + 'static>>,
    {
        let logger = correlate(&req.otel_context(), &self.logger).into_owned();

        if req.uri().path() != self.config.route {
            logger.info(format_args!("No route for {}", req.uri().path()));
            return Ok(text(StatusCode::NOT_FOUND, "Not Found\n"));
        }
        let allowed = self.config.variant.method();
        if req.method() != allowed {
            logger.info(format_args!("Method {} not allowed", req.method()));
            let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n");
            response
                .headers_mut()
                .insert(ALLOW, self.config.variant.allow());
            return Ok(response);
        }

        let message = match self.config.variant {
            Variant::Server => {
                logger.info("In hello handler");
                logger.info("Calling compose_greeting");
                let message = self.compose_greeting(&req);
                logger.info("Finished calling compose_greeting");
                message
            }
            Variant::Function => {
                logger.info("In hello function");
                let name = match read_name(req.into_body()).await {
                    Ok(name) => Some(name),
                    Err(err) => {
                        logger.debug(format_args!("Falling back to default greeting: {err}"));
                        None
                    }
                };
                greeting::json_greeting(name.as_deref())
            }
        };
        Ok(text(StatusCode::OK, message))
    }

    /// Builds the query greeting inside a [`COMPOSE_SPAN_NAME`] span, a child
    /// of the request span.
    fn compose_greeting<B>(&self, req: &Request<B>) -> String {
        let mut span = self
            .tracer
            .span_builder(COMPOSE_SPAN_NAME)
            .with_kind(SpanKind::Internal)
            .start_with_context(&self.tracer, &req.otel_context());
        let message = greeting::query_greeting(req.uri().query());
        span.set_attribute(KeyValue::new("greeting.length", message.len() as i64));
        span.end();
        message
    }
}

async fn read_name<B>(body: B) -> Result<String, DecodeError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn Error + Send + Sync + 'static>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(DecodeError::Body)?
        .to_bytes();
    greeting::decode_name(&bytes)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> GreeterResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Boxed request function as wrapped by [`instrument`].
pub type GreetFn<B> =
    Box<dyn Fn(Request<B>) -> BoxFuture<'static, Result<GreeterResponse, Infallible>> + Send + Sync>;

/// The greeter for `config`, traced by `telemetry` with one
/// [`SPAN_NAME`] span per request.
pub fn instrument<B>(config: ServerConfig, telemetry: &Telemetry) -> InstrumentedHandler<GreetFn<B>>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<Box<dyn Error + Send + Sync + 'static>>,
{
    let greeter = Arc::new(Greeter::new(config, telemetry));
    let greet: GreetFn<B> = Box::new(move |req: Request<B>| {
        let greeter = Arc::clone(&greeter);
        async move { greeter.respond(req).await }.boxed()
    });
    wrap(SPAN_NAME, greet, telemetry)
}

/// Accepts connections on `listener` until `shutdown` completes, serving
/// each connection on its own task.
///
/// Failed accepts are logged and retried. Once `shutdown` completes, open
/// connections get [`DRAIN_TIMEOUT`] to finish before they are aborted.
pub async fn serve<S>(
    listener: TcpListener,
    handler: InstrumentedHandler<GreetFn<hyper::body::Incoming>>,
    shutdown: S,
) where
    S: Future<Output = ()>,
{
    let handler = Arc::new(handler);
    let mut connections = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // Typically out of file descriptors; back off instead of spinning.
                    warn!(name: "Greeter.AcceptFailed", error = %err);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            _ = &mut shutdown => break,
        };

        let handler = Arc::clone(&handler);
        connections.spawn(async move {
            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { handler.handle(req).await }
            });
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(name: "Greeter.ConnectionFailed", peer = %peer, error = %err);
            }
        });
    }

    info!(
        name: "Greeter.StoppedAccepting",
        open_connections = connections.len(),
        message = "draining open connections",
    );
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            name: "Greeter.DrainTimedOut",
            aborted_connections = connections.len(),
        );
        connections.shutdown().await;
    }
}

/// Runs `variant` as a process: reads configuration, installs telemetry,
/// serves until SIGTERM or Ctrl-C and shuts telemetry down.
///
/// Failing to set up telemetry or the listener is fatal. A failed telemetry
/// shutdown is logged and does not change the result.
pub async fn run(variant: Variant) -> Result<(), Box<dyn Error + Send + Sync + 'static>> {
    let server_config = ServerConfig::from_env(variant)?;
    let telemetry = Telemetry::init(variant.telemetry_config().with_env()?)?;
    telemetry.install()?;
    // Covers the early returns below.
    let _guard = telemetry.shutdown_guard();

    let addr = server_config.addr();
    let listener = TcpListener::bind(addr).await?;
    info!(
        name: "Greeter.Listening",
        address = %addr,
        route = %server_config.route,
        method = %variant.method(),
    );

    serve(listener, instrument(server_config, &telemetry), shutdown_signal()).await;

    if let Err(err) = telemetry.shutdown(telemetry.config().flush_timeout).await {
        error!(name: "Greeter.TelemetryShutdownFailed", error = %err);
    }
    Ok(())
}
