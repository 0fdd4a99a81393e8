use opentelemetry::trace::{TraceContextExt, Tracer};
use opentelemetry::Context;
use opentelemetry_http_instrumentation::testing::InMemoryPipeline;
use opentelemetry_http_instrumentation::{
    correlate, ExportError, Logger, TelemetryConfig, TRACE_FLAGS_FIELD, TRACE_ID_FIELD,
};
use std::time::Duration;

const DEADLINE: Duration = Duration::from_secs(5);

fn pipeline() -> InMemoryPipeline {
    InMemoryPipeline::batched(TelemetryConfig::new("flush-test").with_log_to_stdout(false))
}

#[tokio::test]
async fn force_flush_exports_everything_recorded_before_it() {
    let pipeline = pipeline();
    let _guard = tracing::subscriber::set_default(pipeline.telemetry.subscriber());
    let tracer = pipeline.telemetry.tracer("flush-test");
    let base = Logger::new("flush-test");

    for i in 0..3 {
        tracer.in_span(format!("op-{i}"), |cx| {
            correlate(&cx, &base).info(format_args!("op {i}"));
        });
    }
    base.info("outside any span");

    pipeline.telemetry.force_flush(DEADLINE).await.unwrap();

    let spans = pipeline.finished_spans();
    assert_eq!(spans.len(), 3);
    let logs = pipeline.emitted_logs();
    assert_eq!(logs.len(), 4);

    for log in logs.iter().filter(|log| log.body.as_deref() != Some("outside any span")) {
        let trace_id = log.attribute(TRACE_ID_FIELD).expect("trace_id field");
        assert!(spans
            .iter()
            .any(|span| span.span_context.trace_id().to_string() == trace_id));
        assert_eq!(log.attribute(TRACE_FLAGS_FIELD), Some("01"));
    }
    let outside = logs
        .iter()
        .find(|log| log.body.as_deref() == Some("outside any span"))
        .unwrap();
    assert_eq!(outside.attribute(TRACE_ID_FIELD), None);
    assert_eq!(outside.trace_id, None);
}

#[tokio::test]
async fn flush_can_run_repeatedly_mid_lifetime() {
    let pipeline = pipeline();
    let tracer = pipeline.telemetry.tracer("flush-test");

    tracer.in_span("first", |_cx| {});
    pipeline.telemetry.force_flush(DEADLINE).await.unwrap();
    assert_eq!(pipeline.finished_spans().len(), 1);

    tracer.in_span("second", |_cx| {});
    pipeline.telemetry.force_flush(DEADLINE).await.unwrap();
    let names: Vec<_> = pipeline
        .finished_spans()
        .into_iter()
        .map(|span| span.name.to_string())
        .collect();
    assert_eq!(names, ["first", "second"]);
}

#[tokio::test]
async fn shutdown_drains_both_pipelines_once() {
    let pipeline = pipeline();
    let _guard = tracing::subscriber::set_default(pipeline.telemetry.subscriber());
    let tracer = pipeline.telemetry.tracer("flush-test");
    let base = Logger::new("flush-test");

    let cx = Context::current_with_span(tracer.start("pending"));
    correlate(&cx, &base).info("buffered");
    cx.span().end();

    pipeline.telemetry.shutdown(DEADLINE).await.unwrap();
    assert_eq!(pipeline.finished_spans().len(), 1);
    assert_eq!(pipeline.emitted_logs().len(), 1);

    let again = pipeline.telemetry.shutdown(DEADLINE).await;
    assert!(matches!(again, Err(ExportError::AlreadyShutdown)));

    // Telemetry after shutdown is dropped without panicking.
    tracer.in_span("late", |_cx| {});
    base.info("late");
    assert_eq!(pipeline.finished_spans().len(), 1);
}
