//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Stream per topic**: `publish` appends to the stream named after the topic
//! - **Consumer group per queue**: each bounded context reads its streams
//!   through a group named after its queue, so contexts never steal each
//!   other's messages
//! - **Ack**: `XACK`
//! - **Requeue**: the entry stays pending and is reclaimed (`XAUTOCLAIM`) once
//!   it has been idle for `pending_timeout`
//! - **Reject without requeue**: the entry is copied to `<topic>:dlq`, then acked
//!
//! Topic patterns are resolved to stream names when subscribing: literal
//! patterns name their stream directly (created if missing), wildcard patterns
//! match the streams that exist at that moment.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use courier_events::{
    Acknowledger, Broker, BrokerError, Delivery, Headers, Subscription, topic_matches,
};

/// Suffix of the stream receiving entries rejected without requeue.
const DLQ_SUFFIX: &str = ":dlq";

const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BLOCK: Duration = Duration::from_millis(100);
const READ_COUNT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Malformed stream entry: {0}")]
    Malformed(String),
}

impl From<RedisStreamsError> for BrokerError {
    fn from(err: RedisStreamsError) -> Self {
        match err {
            RedisStreamsError::Connection(msg) => BrokerError::Unavailable(msg),
            other => BrokerError::Subscribe(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    client: Arc<redis::Client>,
    pending_timeout: Duration,
    block: Duration,
}

impl RedisStreamsBroker {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            block: DEFAULT_BLOCK,
        })
    }

    /// How long a requeued entry stays pending before it is redelivered.
    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout = timeout;
        self
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Create the consumer group on `stream` (idempotent).
    fn ensure_group(
        conn: &mut redis::Connection,
        stream: &str,
        group: &str,
    ) -> Result<(), RedisStreamsError> {
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    /// Streams a pattern list refers to.
    fn resolve_streams(
        conn: &mut redis::Connection,
        patterns: &[String],
    ) -> Result<Vec<String>, RedisStreamsError> {
        let mut streams: Vec<String> = patterns
            .iter()
            .filter(|p| !is_wildcard(p))
            .cloned()
            .collect();

        if patterns.iter().any(|p| is_wildcard(p)) {
            let keys: Vec<String> = redis::cmd("KEYS")
                .arg("*")
                .query(conn)
                .map_err(|e| RedisStreamsError::Command(format!("KEYS failed: {e}")))?;
            streams.extend(keys.into_iter().filter(|key| {
                !key.ends_with(DLQ_SUFFIX) && patterns.iter().any(|p| topic_matches(p, key))
            }));
        }

        streams.sort();
        streams.dedup();
        Ok(streams)
    }
}

impl Broker for RedisStreamsBroker {
    #[instrument(skip(self, body, headers), fields(body_len = body.len()), err)]
    fn publish(
        &self,
        topic: &str,
        body: &[u8],
        headers: &Headers,
        message_id: &str,
    ) -> Result<(), BrokerError> {
        let headers = serde_json::to_string(headers)
            .map_err(|e| BrokerError::NotConfirmed(format!("headers do not serialise: {e}")))?;
        let mut conn = self.connection()?;

        let entry_id: String = redis::cmd("XADD")
            .arg(topic)
            .arg("*")
            .arg("message_id")
            .arg(message_id)
            .arg("headers")
            .arg(&headers)
            .arg("body")
            .arg(body)
            .query(&mut conn)
            .map_err(|e| BrokerError::NotConfirmed(format!("XADD failed: {e}")))?;

        debug!(topic, entry_id = %entry_id, "stream entry appended");
        Ok(())
    }

    #[instrument(skip(self), err)]
    fn subscribe(
        &self,
        queue: &str,
        patterns: &[String],
    ) -> Result<Subscription<Delivery>, BrokerError> {
        let mut conn = self.connection()?;
        let streams = Self::resolve_streams(&mut conn, patterns)?;
        for stream in &streams {
            Self::ensure_group(&mut conn, stream, queue)?;
        }

        let reader = StreamReader {
            broker: self.clone(),
            group: queue.to_string(),
            consumer: format!("{queue}-{}", uuid::Uuid::now_v7()),
            streams,
        };
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("{queue}-redis-reader"))
            .spawn(move || reader.run(conn, &tx))
            .map_err(|e| BrokerError::Subscribe(e.to_string()))?;

        Ok(Subscription::new(rx))
    }
}

/// Background poller feeding one subscription.
struct StreamReader {
    broker: RedisStreamsBroker,
    group: String,
    consumer: String,
    streams: Vec<String>,
}

impl StreamReader {
    /// Poll until the subscription is dropped.
    fn run(self, mut conn: redis::Connection, tx: &mpsc::Sender<Delivery>) {
        if self.streams.is_empty() {
            warn!(group = %self.group, "subscription matches no stream");
        }
        loop {
            match self.poll(&mut conn) {
                Ok(deliveries) => {
                    for delivery in deliveries {
                        if tx.send(delivery).is_err() {
                            debug!(group = %self.group, "subscription dropped; reader stopping");
                            return;
                        }
                    }
                }
                Err(e) => {
                    error!(group = %self.group, error = %e, "failed to read from streams");
                    thread::sleep(self.broker.pending_timeout.min(Duration::from_secs(1)));
                    match self.broker.connection() {
                        Ok(fresh) => conn = fresh,
                        Err(e) => error!(group = %self.group, error = %e, "reconnect failed"),
                    }
                }
            }
        }
    }

    fn poll(&self, conn: &mut redis::Connection) -> Result<Vec<Delivery>, RedisStreamsError> {
        if self.streams.is_empty() {
            thread::sleep(self.broker.block);
            return Ok(Vec::new());
        }

        let mut deliveries = Vec::new();
        for stream in &self.streams {
            for entry in self.reclaim(conn, stream)? {
                deliveries.push(self.delivery(stream, entry));
            }
        }
        if !deliveries.is_empty() {
            return Ok(deliveries);
        }

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(self.broker.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.streams[..]);
        for _ in &self.streams {
            cmd.arg(">");
        }
        let reply: redis::Value = cmd
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XREADGROUP failed: {e}")))?;

        // Reply: nil on timeout, else [[stream, [entry, ...]], ...].
        if let redis::Value::Bulk(per_stream) = reply {
            for item in per_stream {
                let redis::Value::Bulk(pair) = item else { continue };
                let (Some(name), Some(redis::Value::Bulk(entries))) = (pair.first(), pair.get(1))
                else {
                    continue;
                };
                let stream = value_to_string(name)?;
                for entry in entries {
                    match parse_entry(entry) {
                        Ok(entry) => deliveries.push(self.delivery(&stream, entry)),
                        Err(e) => warn!(stream = %stream, error = %e, "skipping malformed entry"),
                    }
                }
            }
        }
        Ok(deliveries)
    }

    /// Take over entries of this group idle longer than the pending timeout.
    fn reclaim(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
    ) -> Result<Vec<StreamEntry>, RedisStreamsError> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.broker.pending_timeout.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(READ_COUNT)
            .query(conn)
            .map_err(|e| RedisStreamsError::Command(format!("XAUTOCLAIM failed: {e}")))?;

        // Reply: [next-cursor, [entry, ...], ...]
        let redis::Value::Bulk(parts) = reply else {
            return Ok(Vec::new());
        };
        let Some(redis::Value::Bulk(entries)) = parts.get(1) else {
            return Ok(Vec::new());
        };
        Ok(entries.iter().filter_map(|e| parse_entry(e).ok()).collect())
    }

    fn delivery(&self, stream: &str, entry: StreamEntry) -> Delivery {
        let acker = StreamAcker {
            client: Arc::clone(&self.broker.client),
            stream: stream.to_string(),
            group: self.group.clone(),
            entry: entry.clone(),
        };
        Delivery::new(
            stream,
            entry.body,
            entry.headers,
            entry.message_id,
            Box::new(acker),
        )
    }
}

#[derive(Debug, Clone)]
struct StreamEntry {
    entry_id: String,
    message_id: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

struct StreamAcker {
    client: Arc<redis::Client>,
    stream: String,
    group: String,
    entry: StreamEntry,
}

impl StreamAcker {
    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection()
            .map_err(|e| BrokerError::Unavailable(e.to_string()))
    }

    fn xack(&self, conn: &mut redis::Connection) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.entry.entry_id)
            .query(conn)
            .map_err(|e| BrokerError::Settle(format!("XACK failed: {e}")))?;
        Ok(())
    }
}

impl Acknowledger for StreamAcker {
    fn ack(&mut self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        self.xack(&mut conn)
    }

    fn reject(&mut self, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            // Left pending; `XAUTOCLAIM` hands it out again after the timeout.
            return Ok(());
        }
        let mut conn = self.connection()?;
        let headers = serde_json::to_string(&self.entry.headers)
            .map_err(|e| BrokerError::Settle(e.to_string()))?;
        let _: String = redis::cmd("XADD")
            .arg(format!("{}{DLQ_SUFFIX}", self.stream))
            .arg("*")
            .arg("original_entry_id")
            .arg(&self.entry.entry_id)
            .arg("message_id")
            .arg(self.entry.message_id.as_deref().unwrap_or_default())
            .arg("headers")
            .arg(&headers)
            .arg("body")
            .arg(&self.entry.body[..])
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .query(&mut conn)
            .map_err(|e| BrokerError::Settle(format!("DLQ XADD failed: {e}")))?;
        warn!(stream = %self.stream, entry_id = %self.entry.entry_id, "entry moved to dead-letter stream");
        self.xack(&mut conn)
    }
}

fn is_wildcard(pattern: &str) -> bool {
    pattern.split('.').any(|word| word == "*" || word == "#")
}

fn value_to_string(value: &redis::Value) -> Result<String, RedisStreamsError> {
    match value {
        redis::Value::Data(data) => Ok(String::from_utf8_lossy(data).into_owned()),
        redis::Value::Status(s) => Ok(s.clone()),
        other => Err(RedisStreamsError::Malformed(format!("expected a string, got {other:?}"))),
    }
}

/// Parse `[entry-id, [field, value, ...]]`.
fn parse_entry(value: &redis::Value) -> Result<StreamEntry, RedisStreamsError> {
    let redis::Value::Bulk(parts) = value else {
        return Err(RedisStreamsError::Malformed("entry is not an array".to_string()));
    };
    let (Some(id), Some(redis::Value::Bulk(fields))) = (parts.first(), parts.get(1)) else {
        return Err(RedisStreamsError::Malformed("entry has no fields".to_string()));
    };

    let mut entry = StreamEntry {
        entry_id: value_to_string(id)?,
        message_id: None,
        headers: Headers::new(),
        body: Vec::new(),
    };
    for pair in fields.chunks(2) {
        let [redis::Value::Data(key), redis::Value::Data(val)] = pair else {
            continue;
        };
        match key.as_slice() {
            b"message_id" => entry.message_id = Some(String::from_utf8_lossy(val).into_owned()),
            b"headers" => {
                entry.headers = serde_json::from_slice(val)
                    .map_err(|e| RedisStreamsError::Malformed(format!("headers: {e}")))?;
            }
            b"body" => entry.body = val.clone(),
            _ => {}
        }
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_stream_entries() {
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![
                data("message_id"),
                data("0190b8f2-7a4e-7c1a-9f00-000000000001"),
                data("headers"),
                data("{\"event-name\":\"order.placed\"}"),
                data("body"),
                data("{\"id\":1}"),
            ]),
        ]);
        let parsed = parse_entry(&entry).unwrap();
        assert_eq!(parsed.entry_id, "1700000000000-0");
        assert_eq!(
            parsed.message_id.as_deref(),
            Some("0190b8f2-7a4e-7c1a-9f00-000000000001")
        );
        assert_eq!(parsed.headers["event-name"], "order.placed");
        assert_eq!(parsed.body, b"{\"id\":1}");
    }

    #[test]
    fn rejects_entries_without_fields() {
        let entry = redis::Value::Bulk(vec![data("1-0"), redis::Value::Nil]);
        assert!(matches!(parse_entry(&entry), Err(RedisStreamsError::Malformed(_))));
    }

    #[test]
    fn detects_wildcard_patterns() {
        assert!(is_wildcard("courier.order.*"));
        assert!(is_wildcard("courier.#"));
        assert!(!is_wildcard("courier.order.placed"));
    }
}
