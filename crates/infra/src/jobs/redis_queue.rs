//! Redis Streams-backed job queue (durable, at-least-once delivery).
//!
//! ## Architecture
//!
//! - **Stream Key**: `podforge:jobs`, read through one consumer group shared
//!   by every worker process
//! - **Delayed Key**: `podforge:jobs:delayed`, a sorted set scored by
//!   `not_before` (ms); due members are moved onto the stream by whichever
//!   worker removes them first
//! - **Dead-Letter Queue**: `podforge:jobs:dlq`
//! - Entries left unacked longer than the reclaim timeout (a crashed worker)
//!   are claimed by the next reader. The record store rejects the stale
//!   attempt, so a reclaim never runs a job twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::Value;
use tracing::{instrument, warn};

use super::queue::{JobQueue, QueueError};
use super::types::{Delivery, QueueMessage};

/// Default stream key for job messages
pub const DEFAULT_STREAM_KEY: &str = "podforge:jobs";

/// Default dead-letter queue key
pub const DEFAULT_DLQ_KEY: &str = "podforge:jobs:dlq";

/// Default sorted set holding delayed retries
pub const DEFAULT_DELAYED_KEY: &str = "podforge:jobs:delayed";

/// Default consumer group
pub const DEFAULT_GROUP: &str = "podforge-workers";

/// Unacked entries older than this are handed to another consumer.
const DEFAULT_RECLAIM_AFTER_MS: u64 = 60 * 60 * 1000;

/// Longest single XREADGROUP block, so delayed retries are promoted promptly.
const MAX_BLOCK_MS: u64 = 1000;

/// Delayed members promoted per poll.
const PROMOTE_BATCH: usize = 32;

/// Moves one delayed member onto the stream. The member stays in the sorted
/// set until XADD has succeeded; a member another worker already moved is
/// left alone.
///
/// KEYS: delayed set, stream. ARGV: member (the payload), job id, attempt.
const PROMOTE_SCRIPT: &str = r"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('XADD', KEYS[2], '*', 'job_id', ARGV[2], 'attempt', ARGV[3], 'payload', ARGV[1])
redis.call('ZREM', KEYS[1], ARGV[1])
return 1
";

#[derive(Debug, Clone)]
pub struct RedisJobQueue {
    client: Arc<redis::Client>,
    stream_key: String,
    dlq_key: String,
    delayed_key: String,
    group: String,
    consumer: String,
    reclaim_after_ms: u64,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, consumer: impl Into<String>) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| QueueError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: DEFAULT_DLQ_KEY.to_string(),
            delayed_key: DEFAULT_DELAYED_KEY.to_string(),
            group: DEFAULT_GROUP.to_string(),
            consumer: consumer.into(),
            reclaim_after_ms: DEFAULT_RECLAIM_AFTER_MS,
        })
    }

    /// How long an unacked delivery stays with its consumer before another
    /// one may claim it. Should exceed the hard deadline.
    pub fn with_reclaim_after(mut self, after: Duration) -> Self {
        self.reclaim_after_ms = u64::try_from(after.as_millis()).unwrap_or(u64::MAX);
        self
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Connection(e.to_string()))
    }

    /// Ensure the consumer group exists (idempotent).
    pub fn ensure_consumer_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(QueueError::Command(format!("XGROUP CREATE failed: {e}"))),
        }
    }

    fn xadd(&self, conn: &mut redis::Connection, message: &QueueMessage) -> Result<(), QueueError> {
        let payload = encode(message)?;
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("attempt")
            .arg(message.attempt)
            .arg("payload")
            .arg(payload)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XADD failed: {e}")))?;
        Ok(())
    }

    #[instrument(
        skip(self, message),
        fields(job_id = %message.job_id, attempt = message.attempt),
        err
    )]
    fn enqueue_sync(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        if message.is_ready(Utc::now()) {
            return self.xadd(&mut conn, message);
        }
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.delayed_key)
            .arg(message.not_before.timestamp_millis())
            .arg(encode(message)?)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("ZADD failed: {e}")))?;
        Ok(())
    }

    /// Move due delayed messages onto the stream.
    fn promote_due(&self, conn: &mut redis::Connection) -> Result<usize, QueueError> {
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.delayed_key)
            .arg("-inf")
            .arg(Utc::now().timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(PROMOTE_BATCH)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("ZRANGEBYSCORE failed: {e}")))?;

        let script = redis::Script::new(PROMOTE_SCRIPT);
        let mut promoted = 0;
        for member in due {
            let message = match decode(&member) {
                Ok(message) => message,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable delayed message");
                    let _: i64 = redis::cmd("ZREM")
                        .arg(&self.delayed_key)
                        .arg(&member)
                        .query(conn)
                        .map_err(|e| QueueError::Command(format!("ZREM failed: {e}")))?;
                    continue;
                }
            };
            let moved: i64 = script
                .key(&self.delayed_key)
                .key(&self.stream_key)
                .arg(&member)
                .arg(message.job_id.to_string())
                .arg(message.attempt)
                .invoke(conn)
                .map_err(|e| QueueError::Command(format!("promote failed: {e}")))?;
            promoted += usize::from(moved == 1);
        }
        Ok(promoted)
    }

    /// Claim one entry another consumer left unacked for too long.
    fn reclaim(&self, conn: &mut redis::Connection) -> Result<Option<Delivery>, QueueError> {
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(self.reclaim_after_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XPENDING failed: {e}")))?;
        let Some((id, owner, idle_ms, delivered)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Vec<Value> = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.reclaim_after_ms)
            .arg(&id)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XCLAIM failed: {e}")))?;
        let Some(entry) = claimed.first() else {
            return Ok(None);
        };
        warn!(entry_id = %id, previous_consumer = %owner, idle_ms, "reclaimed stale delivery");
        self.into_delivery(conn, entry, u32::try_from(delivered + 1).unwrap_or(u32::MAX))
    }

    fn read_new(
        &self,
        conn: &mut redis::Connection,
        block_ms: u64,
    ) -> Result<Option<Delivery>, QueueError> {
        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XREADGROUP failed: {e}")))?;

        match stream_entries(reply, &self.stream_key).first() {
            Some(entry) => self.into_delivery(conn, entry, 1),
            None => Ok(None),
        }
    }

    /// Decode an entry; undecodable entries are acked and dead-lettered.
    fn into_delivery(
        &self,
        conn: &mut redis::Connection,
        entry: &Value,
        delivery_count: u32,
    ) -> Result<Option<Delivery>, QueueError> {
        let (id, fields) = parse_entry(entry)?;
        let decoded = fields
            .get("payload")
            .ok_or_else(|| QueueError::Serialization("missing payload field".to_string()))
            .and_then(|payload| decode(payload));
        match decoded {
            Ok(message) => Ok(Some(Delivery {
                message,
                receipt: id,
                delivery_count,
            })),
            Err(err) => {
                warn!(entry_id = %id, error = %err, "poison message moved to dead-letter queue");
                let _: String = redis::cmd("XADD")
                    .arg(&self.dlq_key)
                    .arg("*")
                    .arg("original_message_id")
                    .arg(&id)
                    .arg("reason")
                    .arg(err.to_string())
                    .arg("failed_at")
                    .arg(Utc::now().to_rfc3339())
                    .query(conn)
                    .map_err(|e| QueueError::Command(format!("XADD to DLQ failed: {e}")))?;
                self.ack_entry(conn, &id)?;
                Ok(None)
            }
        }
    }

    fn dequeue_sync(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection()?;
        self.promote_due(&mut conn)?;
        if let Some(delivery) = self.reclaim(&mut conn)? {
            return Ok(Some(delivery));
        }
        let block_ms = u64::try_from(wait.as_millis())
            .unwrap_or(u64::MAX)
            .clamp(1, MAX_BLOCK_MS);
        self.read_new(&mut conn, block_ms)
    }

    fn ack_entry(&self, conn: &mut redis::Connection, id: &str) -> Result<(), QueueError> {
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XACK failed: {e}")))?;
        let _: i64 = redis::cmd("XDEL")
            .arg(&self.stream_key)
            .arg(id)
            .query(conn)
            .map_err(|e| QueueError::Command(format!("XDEL failed: {e}")))?;
        Ok(())
    }

    #[instrument(
        skip(self, message),
        fields(job_id = %message.job_id, attempt = message.attempt),
        err
    )]
    fn dead_letter_sync(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("attempt")
            .arg(message.attempt)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("payload")
            .arg(encode(message)?)
            .query(&mut conn)
            .map_err(|e| QueueError::Command(format!("XADD to DLQ failed: {e}")))?;
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(RedisJobQueue) -> Result<T, QueueError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| QueueError::Command(format!("redis task failed: {e}")))?
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        self.blocking(move |q| q.enqueue_sync(&message)).await
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        self.blocking(move |q| q.dequeue_sync(wait)).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let receipt = delivery.receipt.clone();
        self.blocking(move |q| {
            let mut conn = q.connection()?;
            q.ack_entry(&mut conn, &receipt)
        })
        .await
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        let message = message.clone();
        let reason = reason.to_string();
        self.blocking(move |q| q.dead_letter_sync(&message, &reason))
            .await
    }
}

fn encode(message: &QueueMessage) -> Result<String, QueueError> {
    serde_json::to_string(message).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn decode(payload: &str) -> Result<QueueMessage, QueueError> {
    serde_json::from_str(payload).map_err(|e| QueueError::Serialization(e.to_string()))
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// Entries of `stream_key` in an XREADGROUP reply; empty on timeout.
///
/// Reply format: `[[stream_key, [entry, ...]], ...]`, or nil.
fn stream_entries(reply: Value, stream_key: &str) -> Vec<Value> {
    let Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    for stream in streams {
        let Value::Bulk(mut parts) = stream else {
            continue;
        };
        if parts.len() != 2 || value_string(&parts[0]).as_deref() != Some(stream_key) {
            continue;
        }
        if let Value::Bulk(entries) = parts.swap_remove(1) {
            return entries;
        }
    }
    Vec::new()
}

/// Split an entry `[id, [field, value, ...]]` into its id and fields.
fn parse_entry(entry: &Value) -> Result<(String, HashMap<String, String>), QueueError> {
    let Value::Bulk(parts) = entry else {
        return Err(QueueError::Serialization("invalid entry format".to_string()));
    };
    let [id, Value::Bulk(raw_fields)] = parts.as_slice() else {
        return Err(QueueError::Serialization("invalid entry shape".to_string()));
    };
    let id = value_string(id)
        .ok_or_else(|| QueueError::Serialization("invalid entry id".to_string()))?;

    let fields = raw_fields
        .chunks_exact(2)
        .filter_map(|pair| Some((value_string(&pair[0])?, value_string(&pair[1])?)))
        .collect();
    Ok((id, fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use podforge_core::JobId;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(vec![data("job_id"), data("x"), data("payload"), data(payload)]),
        ])
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let message = QueueMessage::first(JobId::new());
        let payload = encode(&message).unwrap();
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data(DEFAULT_STREAM_KEY),
            Value::Bulk(vec![entry("1700000000000-0", &payload)]),
        ])]);

        let entries = stream_entries(reply, DEFAULT_STREAM_KEY);
        assert_eq!(entries.len(), 1);

        let (id, fields) = parse_entry(&entries[0]).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(decode(&fields["payload"]).unwrap(), message);
    }

    #[test]
    fn timeout_reply_has_no_entries() {
        assert!(stream_entries(Value::Nil, DEFAULT_STREAM_KEY).is_empty());
        let other_stream = Value::Bulk(vec![Value::Bulk(vec![
            data("other"),
            Value::Bulk(vec![entry("1-0", "{}")]),
        ])]);
        assert!(stream_entries(other_stream, DEFAULT_STREAM_KEY).is_empty());
    }

    #[test]
    fn promotion_keeps_the_member_until_the_stream_has_it() {
        let xadd = PROMOTE_SCRIPT.find("'XADD'").unwrap();
        let zrem = PROMOTE_SCRIPT.find("'ZREM'").unwrap();
        let guard = PROMOTE_SCRIPT.find("'ZSCORE'").unwrap();
        assert!(guard < xadd && xadd < zrem);
    }

    /// Needs a Redis server: `REDIS_URL=redis://127.0.0.1 cargo test -- --ignored`.
    #[tokio::test]
    #[ignore]
    async fn due_delayed_message_reaches_the_stream_once() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1".to_string());
        let suffix = JobId::new();
        let mut queue = RedisJobQueue::new(&url, "test-consumer").unwrap();
        queue.stream_key = format!("podforge:test:{suffix}");
        queue.delayed_key = format!("podforge:test:{suffix}:delayed");
        queue.ensure_consumer_group().unwrap();

        let message = QueueMessage {
            attempt: 1,
            not_before: Utc::now() - chrono::Duration::seconds(1),
            ..QueueMessage::first(JobId::new())
        };
        let mut conn = queue.connection().unwrap();
        let _: i64 = redis::cmd("ZADD")
            .arg(&queue.delayed_key)
            .arg(message.not_before.timestamp_millis())
            .arg(encode(&message).unwrap())
            .query(&mut conn)
            .unwrap();

        assert_eq!(queue.promote_due(&mut conn).unwrap(), 1);
        assert_eq!(queue.promote_due(&mut conn).unwrap(), 0);
        let remaining: i64 = redis::cmd("ZCARD").arg(&queue.delayed_key).query(&mut conn).unwrap();
        assert_eq!(remaining, 0);

        let delivery = queue.dequeue(Duration::from_millis(100)).await.unwrap().unwrap();
        assert_eq!(delivery.message, message);
        queue.ack(&delivery).await.unwrap();

        let _: i64 = redis::cmd("DEL")
            .arg(&queue.stream_key)
            .arg(&queue.delayed_key)
            .query(&mut conn)
            .unwrap();
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(parse_entry(&data("nope")).is_err());
        assert!(parse_entry(&Value::Bulk(vec![data("1-0")])).is_err());
        assert!(decode("{not json").is_err());
    }
}
