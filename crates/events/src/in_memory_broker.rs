//! In-memory broker for tests/dev.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};

use crate::broker::{
    Acknowledger, Broker, BrokerError, Delivery, Headers, Subscription, topic_matches,
};

/// A message as accepted by `publish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub body: Vec<u8>,
    pub headers: Headers,
    pub message_id: Option<String>,
}

#[derive(Debug)]
struct QueueBinding {
    queue: String,
    patterns: Vec<String>,
    sender: mpsc::Sender<Delivery>,
}

#[derive(Debug, Default)]
struct Inner {
    bindings: Mutex<Vec<QueueBinding>>,
    published: Mutex<Vec<PublishedMessage>>,
    dead: Mutex<Vec<PublishedMessage>>,
    acked: AtomicUsize,
    requeued: AtomicUsize,
    fail_next: AtomicUsize,
    copies: AtomicUsize,
}

/// In-memory topic broker.
///
/// - No IO
/// - Fan-out to every queue whose patterns match the topic
/// - At-least-once: rejected-with-requeue and unsettled deliveries come back
/// - Test hooks: forced publish failures and duplicate delivery
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` publishes fail without delivering anything.
    pub fn fail_next_publishes(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Deliver every published message `copies` times to each bound queue.
    pub fn set_delivery_copies(&self, copies: usize) {
        self.inner.copies.store(copies.max(1), Ordering::SeqCst);
    }

    /// Messages confirmed by `publish`, in publish order.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.inner
            .published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Messages rejected without requeue.
    pub fn dead_messages(&self) -> Vec<PublishedMessage> {
        self.inner.dead.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn acked_count(&self) -> usize {
        self.inner.acked.load(Ordering::SeqCst)
    }

    pub fn requeued_count(&self) -> usize {
        self.inner.requeued.load(Ordering::SeqCst)
    }

    /// Push a raw message to every matching queue, bypassing `publish`.
    ///
    /// Lets tests hand the consumer side messages a real producer would never
    /// send (missing ids, malformed bodies).
    pub fn inject(&self, message: PublishedMessage) -> Result<(), BrokerError> {
        self.inner.fan_out(&message, 1)
    }
}

impl Inner {
    fn fan_out(self: &Arc<Self>, message: &PublishedMessage, copies: usize) -> Result<(), BrokerError> {
        let mut bindings = self.bindings.lock().map_err(|_| BrokerError::Poisoned)?;

        // Drop queues whose consumers went away while publishing.
        bindings.retain(|binding| {
            if !binding
                .patterns
                .iter()
                .any(|pattern| topic_matches(pattern, &message.topic))
            {
                return true;
            }
            (0..copies).all(|_| {
                let delivery = self.delivery(&binding.queue, binding.sender.clone(), message.clone());
                send(&binding.sender, delivery)
            })
        });

        Ok(())
    }

    fn delivery(
        self: &Arc<Self>,
        queue: &str,
        sender: mpsc::Sender<Delivery>,
        message: PublishedMessage,
    ) -> Delivery {
        let acker = InMemoryAck {
            inner: Arc::clone(self),
            queue: queue.to_string(),
            sender,
            message: message.clone(),
        };
        Delivery::new(
            message.topic,
            message.body,
            message.headers,
            message.message_id,
            Box::new(acker),
        )
    }
}

/// Send without letting a bounced delivery requeue itself forever.
fn send(sender: &mpsc::Sender<Delivery>, delivery: Delivery) -> bool {
    match sender.send(delivery) {
        Ok(()) => true,
        Err(mpsc::SendError(bounced)) => {
            bounced.forget();
            false
        }
    }
}

struct InMemoryAck {
    inner: Arc<Inner>,
    queue: String,
    sender: mpsc::Sender<Delivery>,
    message: PublishedMessage,
}

impl Acknowledger for InMemoryAck {
    fn ack(&mut self) -> Result<(), BrokerError> {
        self.inner.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reject(&mut self, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            self.inner.requeued.fetch_add(1, Ordering::SeqCst);
            let redelivery =
                self.inner
                    .delivery(&self.queue, self.sender.clone(), self.message.clone());
            // A closed queue simply loses the message, as with an auto-delete queue.
            send(&self.sender, redelivery);
        } else {
            self.inner
                .dead
                .lock()
                .map_err(|_| BrokerError::Poisoned)?
                .push(self.message.clone());
        }
        Ok(())
    }
}

impl Broker for InMemoryBroker {
    fn publish(
        &self,
        topic: &str,
        body: &[u8],
        headers: &Headers,
        message_id: &str,
    ) -> Result<(), BrokerError> {
        let forced = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if forced.is_ok() {
            return Err(BrokerError::Unavailable("forced publish failure".to_string()));
        }

        let message = PublishedMessage {
            topic: topic.to_string(),
            body: body.to_vec(),
            headers: headers.clone(),
            message_id: Some(message_id.to_string()),
        };

        let copies = self.inner.copies.load(Ordering::SeqCst).max(1);
        self.inner.fan_out(&message, copies)?;
        self.inner
            .published
            .lock()
            .map_err(|_| BrokerError::Poisoned)?
            .push(message);

        Ok(())
    }

    fn subscribe(
        &self,
        queue: &str,
        patterns: &[String],
    ) -> Result<Subscription<Delivery>, BrokerError> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .bindings
            .lock()
            .map_err(|_| BrokerError::Poisoned)?
            .push(QueueBinding {
                queue: queue.to_string(),
                patterns: patterns.to_vec(),
                sender: tx,
            });
        Ok(Subscription::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish(broker: &InMemoryBroker, topic: &str, id: &str) {
        broker
            .publish(topic, b"{}", &Headers::new(), id)
            .expect("publish");
    }

    #[test]
    fn fans_out_to_matching_queues_only() {
        let broker = InMemoryBroker::new();
        let billing = broker
            .subscribe("billing", &["courier.order.*".to_string()])
            .unwrap();
        let shipping = broker
            .subscribe("shipping", &["courier.parcel.#".to_string()])
            .unwrap();

        publish(&broker, "courier.order.placed", "m-1");

        let delivery = billing.try_recv().expect("billing receives");
        assert_eq!(delivery.message_id(), Some("m-1"));
        delivery.ack().unwrap();
        assert!(shipping.try_recv().is_err());
        assert_eq!(broker.acked_count(), 1);
    }

    #[test]
    fn requeued_and_unsettled_deliveries_come_back() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("q", &["t.#".to_string()]).unwrap();
        publish(&broker, "t.a", "m-1");

        sub.try_recv().unwrap().reject(true).unwrap();
        let again = sub.try_recv().expect("requeued");
        drop(again);
        let third = sub.try_recv().expect("unsettled drop requeues");
        third.reject(false).unwrap();

        assert!(sub.try_recv().is_err());
        assert_eq!(broker.requeued_count(), 2);
        assert_eq!(broker.dead_messages().len(), 1);
    }

    #[test]
    fn forced_failures_are_not_recorded_as_published() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        assert!(broker.publish("t.a", b"{}", &Headers::new(), "m-1").is_err());
        publish(&broker, "t.a", "m-2");
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id.as_deref(), Some("m-2"));
    }

    #[test]
    fn duplicate_copies_are_delivered() {
        let broker = InMemoryBroker::new();
        broker.set_delivery_copies(3);
        let sub = broker.subscribe("q", &["t.#".to_string()]).unwrap();
        publish(&broker, "t.a", "m-1");
        let mut count = 0;
        while let Ok(d) = sub.try_recv() {
            d.ack().unwrap();
            count += 1;
        }
        assert_eq!(count, 3);
    }
}
