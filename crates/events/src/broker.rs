//! Message broker abstraction (mechanics only).
//!
//! The broker moves events between bounded contexts. Courier assumes the
//! weakest useful contract and builds its guarantees on top of it:
//!
//! - **At-least-once delivery**: a message may arrive any number of times
//! - **No ordering guarantees**: messages may arrive out of order
//! - **No authoritative state**: the store is the source of truth; the broker
//!   only transports
//!
//! ## Topics and queues
//!
//! Every event type is published to `<root-exchange>.<event-type>`. Each
//! consuming bounded context binds one named queue to all topics its handlers
//! declare interest in. Patterns use AMQP topic syntax: `*` matches exactly
//! one dot-separated word, `#` matches zero or more.
//!
//! ## Settling deliveries
//!
//! A `Delivery` must be settled exactly once, with `ack()` or
//! `reject(requeue)`. Both consume the delivery. A delivery dropped without
//! being settled is returned to its queue, as a broker does when a consumer's
//! channel closes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// Message headers (string map).
pub type Headers = BTreeMap<String, String>;

/// Header carrying the event name of a published record.
pub const EVENT_NAME_HEADER: &str = "event-name";

/// Header carrying the transaction id of a published record.
pub const TRANSACTION_ID_HEADER: &str = "transaction-id";

/// Broker operation error.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    #[error("publish was not confirmed: {0}")]
    NotConfirmed(String),

    #[error("subscription failed: {0}")]
    Subscribe(String),

    #[error("settling delivery failed: {0}")]
    Settle(String),

    #[error("broker state lock poisoned")]
    Poisoned,
}

/// Settles one delivery with the broker that produced it.
pub trait Acknowledger: Send {
    fn ack(&mut self) -> Result<(), BrokerError>;

    fn reject(&mut self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
pub struct Delivery {
    topic: String,
    body: Vec<u8>,
    headers: Headers,
    message_id: Option<String>,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    pub fn new(
        topic: impl Into<String>,
        body: Vec<u8>,
        headers: Headers,
        message_id: Option<String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            topic: topic.into(),
            body,
            headers,
            message_id,
            acker: Some(acker),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Broker-level message id; empty ids are reported as missing.
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Confirm the message; the broker will not deliver it again.
    pub fn ack(mut self) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(mut acker) => acker.ack(),
            None => Ok(()),
        }
    }

    /// Refuse the message. With `requeue` the broker will deliver it again.
    pub fn reject(mut self, requeue: bool) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(mut acker) => acker.reject(requeue),
            None => Ok(()),
        }
    }

    /// Discard without settling (the queue it belonged to is gone).
    pub(crate) fn forget(mut self) {
        self.acker = None;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(mut acker) = self.acker.take() {
            if let Err(err) = acker.reject(true) {
                tracing::warn!(topic = %self.topic, error = %err, "failed to requeue unsettled delivery");
            }
        }
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.topic)
            .field("message_id", &self.message_id)
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

/// A subscription to a queue.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = broker.subscribe("billing", &topics)?;
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(delivery) => bridge.ingest(delivery)?,
///         Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,  // Broker closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Topic publish/subscribe client.
///
/// The trait requires `Send + Sync`; publishers and bridges share one client
/// across worker threads.
pub trait Broker: Send + Sync {
    /// Publish one message and wait for the broker's confirmation.
    ///
    /// `Ok(())` means the broker has taken responsibility for the message.
    fn publish(
        &self,
        topic: &str,
        body: &[u8],
        headers: &Headers,
        message_id: &str,
    ) -> Result<(), BrokerError>;

    /// Bind `queue` to every pattern in `patterns` and start consuming it.
    fn subscribe(
        &self,
        queue: &str,
        patterns: &[String],
    ) -> Result<Subscription<Delivery>, BrokerError>;
}

impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    fn publish(
        &self,
        topic: &str,
        body: &[u8],
        headers: &Headers,
        message_id: &str,
    ) -> Result<(), BrokerError> {
        (**self).publish(topic, body, headers, message_id)
    }

    fn subscribe(
        &self,
        queue: &str,
        patterns: &[String],
    ) -> Result<Subscription<Delivery>, BrokerError> {
        (**self).subscribe(queue, patterns)
    }
}

/// Topic an event type is published to.
pub fn topic_for(root_exchange: &str, event_type: &str) -> String {
    format!("{root_exchange}.{event_type}")
}

/// AMQP-style topic match (`*` = one word, `#` = zero or more words).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    matches_words(&pattern, &topic)
}

fn matches_words(pattern: &[&str], topic: &[&str]) -> bool {
    match pattern.split_first() {
        None => topic.is_empty(),
        Some((&"#", rest)) => (0..=topic.len()).any(|skip| matches_words(rest, &topic[skip..])),
        Some((&word, rest)) => match topic.split_first() {
            Some((&head, tail)) => (word == "*" || word == head) && matches_words(rest, tail),
            None => false,
        },
    }
}
