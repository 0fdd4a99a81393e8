//! Request instrumentation.
//!
//! [`wrap`] turns a plain async request handler into an
//! [`InstrumentedHandler`] that runs every request inside its own server span.
//! The span continues the trace found in the request's `traceparent` header,
//! or starts a new trace when there is none.
//!
//! While the wrapped handler runs, the span-bearing [`Context`] is both the
//! current context and stored in the request's extensions, so handler code can
//! reach it either way:
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use http_body_util::Full;
//! use opentelemetry_http_instrumentation::{
//!     correlate, wrap, Logger, RequestContextExt, Telemetry, TelemetryConfig,
//! };
//! use std::convert::Infallible;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let telemetry = Telemetry::init(TelemetryConfig::new("hello"))?;
//! let base = Logger::new("hello");
//! let handler = wrap(
//!     "hello",
//!     move |req: Request<Full<Bytes>>| {
//!         let logger = correlate(&req.otel_context(), &base).into_owned();
//!         async move {
//!             logger.info("In hello handler");
//!             Ok::<_, Infallible>(Response::new(Full::new(Bytes::from_static(b"Hello, World!\n"))))
//!         }
//!     },
//!     &telemetry,
//! );
//! let response = handler.handle(Request::new(Full::new(Bytes::new()))).await?;
//! # Ok(())
//! # }
//! ```
use crate::telemetry::Telemetry;
use futures_util::FutureExt as _;
use http::{Request, Response};
use opentelemetry::context::FutureExt as _;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracer;
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, URL_PATH,
};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;

const INSTRUMENTATION_SCOPE: &str = "opentelemetry-http-instrumentation";

/// Access to the OpenTelemetry context a request is being handled in.
pub trait RequestContextExt {
    /// The span-bearing context stored by [`InstrumentedHandler`], or
    /// [`Context::current`] for requests that did not go through one.
    fn otel_context(&self) -> Context;
}

impl<B> RequestContextExt for Request<B> {
    fn otel_context(&self) -> Context {
        self.extensions()
            .get::<Context>()
            .cloned()
            .unwrap_or_else(Context::current)
    }
}

/// Wraps `handler` so that each request it serves is traced by a span named
/// `name`.
pub fn wrap<F>(name: impl Into<Cow<'static, str>>, handler: F, telemetry: &Telemetry) -> InstrumentedHandler<F> {
    InstrumentedHandler {
        name: name.into(),
        tracer: telemetry.tracer(INSTRUMENTATION_SCOPE),
        telemetry: telemetry.clone(),
        handler,
    }
}

/// A request handler traced by one server span per request.
///
/// See [`wrap`].
#[derive(Clone, Debug)]
pub struct InstrumentedHandler<F> {
    name: Cow<'static, str>,
    tracer: SdkTracer,
    telemetry: Telemetry,
    handler: F,
}

impl<F> InstrumentedHandler<F> {
    /// The name given to every span this handler starts.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handles one request.
    ///
    /// Exactly one span is started and ended per call, whether the wrapped
    /// handler returns a response, returns an error or panics. Errors are
    /// returned unchanged and panics are resumed once the span has ended.
    ///
    /// When [`flush_per_invocation`](crate::TelemetryConfig::flush_per_invocation)
    /// is set, both pipelines are flushed before this returns, or before a
    /// panic resumes. A failed flush
    /// is logged and does not affect the result.
    pub async fn handle<B, RB, E, Fut>(&self, mut req: Request<B>) -> Result<Response<RB>, E>
    where
        F: Fn(Request<B>) -> Fut,
        Fut: Future<Output = Result<Response<RB>, E>>,
        E: fmt::Display,
    {
        let parent_cx = self.telemetry.extract_context(req.headers());
        let span = self
            .tracer
            .span_builder(self.name.clone())
            .with_kind(SpanKind::Server)
            .with_attributes([
                KeyValue::new(HTTP_REQUEST_METHOD, req.method().as_str().to_owned()),
                KeyValue::new(URL_PATH, req.uri().path().to_owned()),
            ])
            .start_with_context(&self.tracer, &parent_cx);
        let cx = parent_cx.with_span(span);
        req.extensions_mut().insert(cx.clone());

        // The handler is called on first poll so that its synchronous part
        // also runs inside the span's context.
        let handler = &self.handler;
        let invocation = async move { handler(req).await };
        let outcome = AssertUnwindSafe(invocation.with_context(cx.clone()))
            .catch_unwind()
            .await;

        let result = {
            let span = cx.span();
            let result = match outcome {
                Ok(Ok(response)) => {
                    let status = response.status();
                    span.set_attribute(KeyValue::new(
                        HTTP_RESPONSE_STATUS_CODE,
                        i64::from(status.as_u16()),
                    ));
                    if status.is_server_error() {
                        span.set_status(Status::error(status.to_string()));
                    }
                    Ok(response)
                }
                Ok(Err(err)) => {
                    span.set_status(Status::error(err.to_string()));
                    Err(Ok(err))
                }
                Err(panic) => {
                    span.set_status(Status::error("handler panicked"));
                    Err(Err(panic))
                }
            };
            span.end();
            result
        };

        // The span of a panicking invocation is flushed too before unwinding
        // resumes.
        self.flush_invocation().await;
        match result {
            Ok(response) => Ok(response),
            Err(Ok(err)) => Err(err),
            Err(Err(panic)) => std::panic::resume_unwind(panic),
        }
    }

    async fn flush_invocation(&self) {
        if !self.telemetry.config().flush_per_invocation {
            return;
        }
        let deadline = self.telemetry.config().flush_timeout;
        if let Err(err) = self.telemetry.force_flush(deadline).await {
            warn!(name: "InstrumentedHandler.FlushFailed", handler = %self.name, error = %err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TelemetryConfig;
    use crate::logger::{correlate, correlate_current, Logger, SPAN_ID_FIELD, TRACE_ID_FIELD};
    use crate::testing::InMemoryPipeline;
    use bytes::Bytes;
    use futures_util::FutureExt as _;
    use http::StatusCode;
    use http_body_util::Full;
    use opentelemetry::trace::{SpanId, Status, TraceId};
    use std::convert::Infallible;

    fn request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .unwrap()
    }

    fn ok(body: &'static str) -> Response<Full<Bytes>> {
        Response::new(Full::new(Bytes::from_static(body.as_bytes())))
    }

    #[tokio::test]
    async fn starts_root_span_without_upstream_context() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async { Ok::<_, Infallible>(ok("hi")) },
            &pipeline.telemetry,
        );

        let response = handler.handle(request("/hello?x=1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "hello");
        assert_eq!(span.span_kind, SpanKind::Server);
        assert_eq!(span.parent_span_id, SpanId::INVALID);
        assert_eq!(span.status, Status::Unset);
        assert!(span
            .attributes
            .contains(&KeyValue::new(URL_PATH, "/hello".to_string())));
        assert!(span
            .attributes
            .contains(&KeyValue::new(HTTP_RESPONSE_STATUS_CODE, 200_i64)));
    }

    #[tokio::test]
    async fn continues_upstream_trace() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async { Ok::<_, Infallible>(ok("hi")) },
            &pipeline.telemetry,
        );

        let mut req = request("/hello");
        req.headers_mut().insert(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
                .parse()
                .unwrap(),
        );
        handler.handle(req).await.unwrap();

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(
            spans[0].span_context.trace_id(),
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
        );
        assert_eq!(
            spans[0].parent_span_id,
            SpanId::from_hex("00f067aa0ba902b7").unwrap()
        );
    }

    #[tokio::test]
    async fn context_is_visible_only_while_handler_runs() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |req: Request<Full<Bytes>>| async move {
                let from_request = req.otel_context().span().span_context().clone();
                let current = Context::current().span().span_context().clone();
                assert!(from_request.is_valid());
                assert_eq!(from_request, current);
                Ok::<_, Infallible>(ok("hi"))
            },
            &pipeline.telemetry,
        );

        assert!(!Context::current().span().span_context().is_valid());
        handler.handle(request("/hello")).await.unwrap();
        assert!(!Context::current().span().span_context().is_valid());
        assert!(!request("/").otel_context().span().span_context().is_valid());
    }

    #[tokio::test]
    async fn error_ends_span_once_with_error_status() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async { Err::<Response<Full<Bytes>>, _>("boom") },
            &pipeline.telemetry,
        );

        let err = handler.handle(request("/hello")).await.unwrap_err();
        assert_eq!(err, "boom");

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("boom"));
    }

    #[tokio::test]
    async fn server_error_response_marks_span() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async {
                let mut response = ok("unavailable");
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                Ok::<_, Infallible>(response)
            },
            &pipeline.telemetry,
        );

        handler.handle(request("/hello")).await.unwrap();
        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        assert!(matches!(spans[0].status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn panic_ends_span_once_and_resumes() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, Infallible>(ok("unreachable"))
            },
            &pipeline.telemetry,
        );

        let outcome = AssertUnwindSafe(handler.handle(request("/hello")))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("handler panicked"));
    }

    #[tokio::test]
    async fn one_span_per_request() {
        let pipeline = InMemoryPipeline::simple(TelemetryConfig::new("test"));
        let handler = wrap(
            "hello",
            |req: Request<Full<Bytes>>| async move {
                if req.uri().path() == "/fail" {
                    return Err("failed");
                }
                Ok(ok("hi"))
            },
            &pipeline.telemetry,
        );

        for path in ["/a", "/fail", "/b", "/fail", "/c"] {
            let _ = handler.handle(request(path)).await;
        }

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 5);
        let mut span_ids: Vec<_> = spans.iter().map(|span| span.span_context.span_id()).collect();
        span_ids.sort_by_key(|id| id.to_string());
        span_ids.dedup();
        assert_eq!(span_ids.len(), 5);
    }

    #[tokio::test]
    async fn flush_per_invocation_exports_before_returning() {
        let pipeline = InMemoryPipeline::batched(
            TelemetryConfig::new("test")
                .with_flush_per_invocation(true)
                .with_log_to_stdout(false),
        );
        let base = Logger::new("hello");
        let handler = wrap(
            "hello",
            move |req: Request<Full<Bytes>>| {
                let logger = correlate(&req.otel_context(), &base).into_owned();
                async move {
                    logger.info("In hello handler");
                    Ok::<_, Infallible>(ok("hi"))
                }
            },
            &pipeline.telemetry,
        );

        let _guard = tracing::subscriber::set_default(pipeline.telemetry.subscriber());
        handler.handle(request("/hello")).await.unwrap();

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        let logs = pipeline.emitted_logs();
        let log = logs
            .iter()
            .find(|log| log.body.as_deref() == Some("In hello handler"))
            .expect("handler log exported");
        let trace_id = spans[0].span_context.trace_id().to_string();
        let span_id = spans[0].span_context.span_id().to_string();
        assert_eq!(log.attribute(TRACE_ID_FIELD), Some(trace_id.as_str()));
        assert_eq!(log.attribute(SPAN_ID_FIELD), Some(span_id.as_str()));
        assert_eq!(log.trace_id, Some(spans[0].span_context.trace_id()));
    }

    #[tokio::test]
    async fn without_flush_per_invocation_spans_stay_buffered() {
        let pipeline = InMemoryPipeline::batched(
            TelemetryConfig::new("test").with_flush_per_invocation(false),
        );
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async { Ok::<_, Infallible>(ok("hi")) },
            &pipeline.telemetry,
        );

        handler.handle(request("/hello")).await.unwrap();
        assert!(pipeline.finished_spans().is_empty());
        pipeline
            .telemetry
            .force_flush(std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pipeline.finished_spans().len(), 1);
    }

    #[tokio::test]
    async fn panicking_invocation_is_flushed_before_unwinding() {
        let pipeline = InMemoryPipeline::batched(
            TelemetryConfig::new("test").with_flush_per_invocation(true),
        );
        let handler = wrap(
            "hello",
            |_req: Request<Full<Bytes>>| async {
                if true {
                    panic!("handler blew up");
                }
                Ok::<_, Infallible>(ok("unreachable"))
            },
            &pipeline.telemetry,
        );

        let outcome = AssertUnwindSafe(handler.handle(request("/hello")))
            .catch_unwind()
            .await;
        assert!(outcome.is_err());

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status, Status::error("handler panicked"));
    }

    #[tokio::test]
    async fn concurrent_requests_do_not_share_context() {
        const REQUESTS: usize = 8;
        let pipeline = InMemoryPipeline::simple(
            TelemetryConfig::new("test")
                .with_flush_per_invocation(false)
                .with_log_to_stdout(false),
        );
        let base = Logger::new("hello");
        let handler = wrap(
            "hello",
            move |_req: Request<Full<Bytes>>| {
                let base = base.clone();
                async move {
                    // Interleave with the other requests before logging.
                    tokio::task::yield_now().await;
                    correlate_current(&base).info("In hello handler");
                    tokio::task::yield_now().await;
                    Ok::<_, Infallible>(ok("hi"))
                }
            },
            &pipeline.telemetry,
        );

        let _guard = tracing::subscriber::set_default(pipeline.telemetry.subscriber());
        let responses = futures_util::future::join_all(
            (0..REQUESTS).map(|i| handler.handle(request(&format!("/hello?i={i}")))),
        )
        .await;
        assert!(responses.iter().all(Result::is_ok));

        let spans = pipeline.finished_spans();
        assert_eq!(spans.len(), REQUESTS);
        let mut span_ids: Vec<String> = spans
            .iter()
            .map(|span| span.span_context.span_id().to_string())
            .collect();
        span_ids.sort();
        span_ids.dedup();
        assert_eq!(span_ids.len(), REQUESTS);

        let logs: Vec<_> = pipeline
            .emitted_logs()
            .into_iter()
            .filter(|log| log.body.as_deref() == Some("In hello handler"))
            .collect();
        assert_eq!(logs.len(), REQUESTS);
        for span_id in &span_ids {
            let matching = logs
                .iter()
                .filter(|log| log.attribute(SPAN_ID_FIELD) == Some(span_id.as_str()))
                .count();
            assert_eq!(matching, 1, "span {span_id} should own exactly one log");
        }
        for log in &logs {
            let span = spans
                .iter()
                .find(|span| log.span_id == Some(span.span_context.span_id()))
                .expect("log emitted inside a request span");
            assert_eq!(
                log.attribute(TRACE_ID_FIELD),
                Some(span.span_context.trace_id().to_string().as_str())
            );
        }
    }
}
