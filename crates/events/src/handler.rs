//! Handler registry: event type → ordered handlers for one bounded context.
//!
//! The registry is built once, explicitly, at process bootstrap and then
//! shared read-only (`Arc<HandlerRegistry<C>>`). There is no runtime discovery.
//!
//! ## Handler modes
//!
//! - `Sync` handlers run in-process, inside the producing transaction, via
//!   `dispatch_sync`.
//! - `Async` handlers run later, from the inbox, via `dispatch_async`. Only
//!   event types with at least one async handler are bound to the broker.
//!
//! `C` is the bounded context's infrastructure value (repositories, clients,
//! an outbox writer...) handed to every handler call.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::envelope::EventEnvelope;

/// Boxed handler function.
pub type HandlerFn<C> = Arc<dyn Fn(&C, &EventEnvelope) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerMode {
    Sync,
    Async,
}

/// A handler plus the metadata used for logging and dispatch.
pub struct RegisteredHandler<C> {
    name: String,
    mode: HandlerMode,
    handler: HandlerFn<C>,
}

impl<C> RegisteredHandler<C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> HandlerMode {
        self.mode
    }

    /// Run the handler. A panic is caught and reported as an error.
    pub fn call(&self, ctx: &C, envelope: &EventEnvelope) -> anyhow::Result<()> {
        panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(ctx, envelope)))
            .unwrap_or_else(|payload| Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl<C> core::fmt::Debug for RegisteredHandler<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No handler of any mode is registered for the event type.
    #[error("no handler registered for event type '{0}'")]
    UnknownEventType(String),

    /// A handler returned an error; later handlers were not run.
    #[error("handler '{handler}' failed: {source:#}")]
    HandlerFailed {
        handler: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Per-bounded-context handler table.
pub struct HandlerRegistry<C> {
    context: String,
    handlers: BTreeMap<String, Vec<RegisteredHandler<C>>>,
}

impl<C> HandlerRegistry<C> {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            handlers: BTreeMap::new(),
        }
    }

    /// Bounded-context name; also the consumer name of its inbox rows.
    pub fn context_name(&self) -> &str {
        &self.context
    }

    /// Append a handler for `event_type`. Handlers run in registration order.
    pub fn register<F>(
        &mut self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        mode: HandlerMode,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(&C, &EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers
            .entry(event_type.into())
            .or_default()
            .push(RegisteredHandler {
                name: name.into(),
                mode,
                handler: Arc::new(handler),
            });
        self
    }

    /// Register a handler that receives the payload decoded as `E`.
    ///
    /// A payload that does not decode is reported as a handler failure, so it
    /// is retried and eventually dead-lettered like any other failure.
    pub fn register_typed<E, F>(
        &mut self,
        event_type: impl Into<String>,
        name: impl Into<String>,
        mode: HandlerMode,
        handler: F,
    ) -> &mut Self
    where
        E: DeserializeOwned,
        F: Fn(&C, E, &EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(event_type, name, mode, move |ctx: &C, envelope: &EventEnvelope| {
            let event: E = envelope.decode().map_err(|e| {
                anyhow::anyhow!("payload of '{}' does not decode: {e}", envelope.event_name())
            })?;
            handler(ctx, event, envelope)
        })
    }

    /// Whether any handler (of either mode) knows this event type.
    pub fn contains(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    /// Event types that have at least one async handler (the broker bindings).
    pub fn event_types(&self) -> Vec<&str> {
        self.handlers
            .iter()
            .filter(|(_, hs)| hs.iter().any(|h| h.mode == HandlerMode::Async))
            .map(|(event_type, _)| event_type.as_str())
            .collect()
    }

    pub fn handlers(&self, event_type: &str, mode: HandlerMode) -> Vec<&RegisteredHandler<C>> {
        self.handlers
            .get(event_type)
            .map(|hs| hs.iter().filter(|h| h.mode == mode).collect())
            .unwrap_or_default()
    }

    pub fn async_handlers(&self, event_type: &str) -> Vec<&RegisteredHandler<C>> {
        self.handlers(event_type, HandlerMode::Async)
    }

    /// Run the synchronous handlers for an event, stopping at the first failure.
    ///
    /// Returns how many handlers ran. An unknown type runs nothing.
    pub fn dispatch_sync(&self, ctx: &C, envelope: &EventEnvelope) -> Result<usize, DispatchError> {
        self.run(ctx, envelope, HandlerMode::Sync)
    }

    /// Run the asynchronous handlers for an event, stopping at the first failure.
    ///
    /// An event type this context never registered is `UnknownEventType`.
    pub fn dispatch_async(&self, ctx: &C, envelope: &EventEnvelope) -> Result<usize, DispatchError> {
        if !self.contains(envelope.event_name()) {
            return Err(DispatchError::UnknownEventType(
                envelope.event_name().to_string(),
            ));
        }
        self.run(ctx, envelope, HandlerMode::Async)
    }

    fn run(&self, ctx: &C, envelope: &EventEnvelope, mode: HandlerMode) -> Result<usize, DispatchError> {
        let handlers = self.handlers(envelope.event_name(), mode);
        for handler in &handlers {
            tracing::debug!(
                context = %self.context,
                handler = handler.name(),
                event_name = envelope.event_name(),
                transaction_id = %envelope.transaction_id(),
                "invoking handler"
            );
            handler
                .call(ctx, envelope)
                .map_err(|source| DispatchError::HandlerFailed {
                    handler: handler.name().to_string(),
                    source,
                })?;
        }
        Ok(handlers.len())
    }
}

impl<C> core::fmt::Debug for HandlerRegistry<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("context", &self.context)
            .field("handlers", &self.handlers)
            .finish()
    }
}
