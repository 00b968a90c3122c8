//! Observability for the sandbox shim.
//!
//! - **Logging**: `tracing-subscriber` setup. Output never goes to the
//!   process' own stdout/stderr, which belong to the container.
//! - **Tracing**: the [`tracer::Tracer`] abstraction that wraps each session
//!   phase in a span, with a no-op implementation for when tracing is off.
//! - **Ids**: OpenTelemetry-compatible trace/span id generation.

pub mod logging;
pub mod tracer;
pub mod tracing_setup;

pub use tracer::{create_tracer, NoopTracer, Span, SpanContext, SpanTracer, Tracer};
