//! Event mechanics: envelopes, handler registration, broker abstraction and the
//! saga step contract.
//!
//! Nothing here touches storage; `courier-infra` composes these pieces with a
//! store to build the outbox, inbox and saga machinery.

pub mod broker;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_broker;
pub mod saga;

pub use broker::{
    Acknowledger, Broker, BrokerError, Delivery, Headers, Subscription, topic_for, topic_matches,
    EVENT_NAME_HEADER, TRANSACTION_ID_HEADER,
};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::{DispatchError, HandlerFn, HandlerMode, HandlerRegistry, RegisteredHandler};
pub use in_memory_broker::{InMemoryBroker, PublishedMessage};
pub use saga::{HistoryEntry, Step, StepState, WorkflowRecord};
