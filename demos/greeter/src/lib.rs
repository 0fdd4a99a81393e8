//! A greeting service instrumented end to end.
//!
//! Two deployables share this library:
//!
//! * `hello-server` answers `GET /hello?name=...` with `Hello, <name>!` as a
//!   long-running process.
//! * `hello-function` answers `POST /api/hello` with a JSON body
//!   `{"name": "..."}` as a serverless custom handler.
//!
//! Every request runs inside a `hello` server span, every log line written
//! while handling it carries the span's trace identifiers, and both pipelines
//! are flushed before the response is returned.
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unreachable_pub,
    unused
)]

pub mod greeting;
pub mod server;

pub use greeting::DecodeError;
pub use server::{
    instrument, run, serve, ConfigError, GreetFn, Greeter, GreeterResponse, ServerConfig, Variant,
    COMPOSE_SPAN_NAME, DRAIN_TIMEOUT, MAX_BODY_BYTES, SPAN_NAME,
};
