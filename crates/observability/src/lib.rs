//! Tracing, logging and trace-context propagation shared by courier crates.

/// Logging/tracing subscriber setup.
pub mod logging;

/// W3C trace-context carried across the broker and stored on records.
pub mod trace_context;

pub use logging::LogFormat;
pub use trace_context::{TraceContext, TraceGuard, TRACEPARENT, TRACESTATE};

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    logging::init(LogFormat::Json);
}
