//! Trace-context propagation (W3C `traceparent` / `tracestate`).
//!
//! A `TraceContext` is the serialized form of an OpenTelemetry context: the
//! carrier map the W3C propagator writes. It is captured when an outbox record
//! is written, travels as broker headers, is stored on the inbox record, and is
//! restored as the parent of the span the record's handlers run in. Every step
//! tolerates an empty or malformed context: observability never blocks
//! processing.

use std::collections::BTreeMap;

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanContext, TraceContextExt, TraceFlags, TraceState};
use opentelemetry::{Context, ContextGuard};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use serde::{Deserialize, Serialize};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// W3C trace parent header.
pub const TRACEPARENT: &str = "traceparent";

/// W3C vendor trace state header.
pub const TRACESTATE: &str = "tracestate";

/// Keeps an entered context attached to the current thread until dropped.
pub type TraceGuard = ContextGuard;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceContext(BTreeMap<String, String>);

impl TraceContext {
    /// A context carrying nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Start a new trace.
    pub fn new_root() -> Self {
        let ids = RandomIdGenerator::default();
        Self::from_span_context(SpanContext::new(
            ids.new_trace_id(),
            ids.new_span_id(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        ))
    }

    /// The active context on this thread, or a new root.
    ///
    /// The current `tracing` span wins when the OpenTelemetry layer is
    /// installed; otherwise the context attached with `enter` is used.
    pub fn current() -> Self {
        let active = [tracing::Span::current().context(), Context::current()]
            .into_iter()
            .map(|cx| cx.span().span_context().clone())
            .find(SpanContext::is_valid);
        match active {
            Some(span_context) => Self::from_span_context(span_context),
            None => Self::new_root(),
        }
    }

    /// Same trace, new span id. Falls back to a new root when the parent is unusable.
    pub fn child(&self) -> Self {
        let cx = self.otel_context();
        let parent = cx.span().span_context().clone();
        if !parent.is_valid() {
            return Self::new_root();
        }
        Self::from_span_context(SpanContext::new(
            parent.trace_id(),
            RandomIdGenerator::default().new_span_id(),
            parent.trace_flags(),
            false,
            parent.trace_state().clone(),
        ))
    }

    /// Extract a context from message headers (header names are case-insensitive).
    pub fn from_headers(headers: &BTreeMap<String, String>) -> Self {
        let cx = TraceContextPropagator::new().extract(&HeaderExtractor(headers));
        Self::from_otel(&cx)
    }

    /// Write this context into outgoing headers.
    pub fn inject(&self, headers: &mut BTreeMap<String, String>) {
        TraceContextPropagator::new().inject_context(&self.otel_context(), &mut HeaderInjector(headers));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// The 32-hex-digit trace id, if the `traceparent` is well formed.
    pub fn trace_id(&self) -> Option<String> {
        let cx = self.otel_context();
        let span_context = cx.span().span_context().clone();
        span_context
            .is_valid()
            .then(|| span_context.trace_id().to_string())
    }

    /// The OpenTelemetry context this carrier describes (a remote parent).
    pub fn otel_context(&self) -> Context {
        TraceContextPropagator::new().extract(&HeaderExtractor(&self.0))
    }

    /// Attach this context to the current thread until the guard drops.
    pub fn enter(&self) -> TraceGuard {
        self.otel_context().attach()
    }

    /// A `tracing` span parented on this context.
    ///
    /// With the OpenTelemetry layer installed the span becomes a real child of
    /// the remote span; the trace id is also recorded as a field for plain logs.
    pub fn span(&self, operation: &'static str) -> tracing::Span {
        let span = tracing::info_span!("courier", operation, trace_id = tracing::field::Empty);
        if let Some(trace_id) = self.trace_id() {
            span.record("trace_id", trace_id.as_str());
        }
        span.set_parent(self.otel_context());
        span
    }

    fn from_span_context(span_context: SpanContext) -> Self {
        Self::from_otel(&Context::new().with_remote_span_context(span_context))
    }

    fn from_otel(cx: &Context) -> Self {
        let mut map = BTreeMap::new();
        TraceContextPropagator::new().inject_context(cx, &mut HeaderInjector(&mut map));
        Self(map)
    }
}

struct HeaderExtractor<'a>(&'a BTreeMap<String, String>);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

struct HeaderInjector<'a>(&'a mut BTreeMap<String, String>);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn root_context_is_well_formed() {
        let ctx = TraceContext::new_root();
        let trace_id = ctx.trace_id().expect("trace id");
        assert_eq!(trace_id.len(), 32);
        assert!(ctx.get(TRACEPARENT).unwrap().starts_with("00-"));
    }

    #[test]
    fn child_keeps_trace_id_and_changes_span() {
        let parent = TraceContext::new_root();
        let child = parent.child();
        assert_eq!(child.trace_id(), parent.trace_id());
        assert_ne!(child.get(TRACEPARENT), parent.get(TRACEPARENT));
    }

    #[test]
    fn current_inherits_entered_context() {
        let parent = TraceContext::new_root();
        {
            let _guard = parent.enter();
            assert_eq!(TraceContext::current().trace_id(), parent.trace_id());
        }
        assert_ne!(TraceContext::current().trace_id(), parent.trace_id());
    }

    #[test]
    fn headers_round_trip_case_insensitively() {
        let ctx = TraceContext::new_root();
        let mut headers = BTreeMap::new();
        headers.insert("event-name".to_string(), "order.created".to_string());
        ctx.inject(&mut headers);

        let upper: BTreeMap<String, String> = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        let extracted = TraceContext::from_headers(&upper);
        assert_eq!(extracted, ctx);
    }

    #[test]
    fn malformed_parent_yields_no_trace_id_and_a_fresh_child() {
        let mut headers = BTreeMap::new();
        headers.insert(TRACEPARENT.to_string(), "garbage".to_string());
        let ctx = TraceContext::from_headers(&headers);
        assert!(ctx.is_empty());
        assert!(ctx.trace_id().is_none());
        assert!(ctx.child().trace_id().is_some());
    }

    #[test]
    fn spans_are_children_of_the_stored_context() {
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("courier-test")));
        let stored = TraceContext::new_root();

        tracing::subscriber::with_default(subscriber, || {
            let span = stored.span("inbox.process");
            let _entered = span.enter();
            let cx = span.context();
            let span_context = cx.span().span_context().clone();
            assert_eq!(Some(span_context.trace_id().to_string()), stored.trace_id());
            let stored_cx = stored.otel_context();
            assert_ne!(span_context.span_id(), stored_cx.span().span_context().span_id());

            // Records written inside the span continue the same trace.
            let written = TraceContext::current();
            assert_eq!(written.trace_id(), stored.trace_id());
            assert_ne!(written, stored);
        });
    }
}
