use serde::Serialize;

/// A domain event that can leave its bounded context.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **named** (the name selects the broker topic and the consumer's handlers)
/// - **serializable** (the payload schema belongs to the producing context)
pub trait Event: Serialize + core::fmt::Debug + Send + Sync {
    /// Stable event name/type identifier (e.g. "sales.order.confirmed").
    fn event_type(&self) -> &'static str;
}
