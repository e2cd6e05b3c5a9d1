//! Job queue abstraction and the in-memory queue.
//!
//! Delivery is at-least-once: a message stays with the queue until acked, and
//! the same job/attempt may be handed out more than once. Workers make
//! duplicates harmless through the record store's attempt guard.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use podforge_core::JobId;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::types::{DeadLetterEntry, Delivery, QueueMessage};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a message; it becomes visible once its `not_before` has passed.
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError>;

    /// Wait up to `wait` for a ready message.
    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Record a message that will not be retried.
    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError>;

    /// Entry point for newly created jobs.
    async fn submit(&self, job_id: JobId) -> Result<(), QueueError> {
        self.enqueue(QueueMessage::first(job_id)).await
    }
}

/// Queue error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("command error: {0}")]
    Command(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unknown delivery receipt: {0}")]
    UnknownReceipt(String),
}

/// Unacked deliveries are handed out again after this long.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

struct Pending {
    ready_at: Instant,
    message: QueueMessage,
}

struct InFlight {
    message: QueueMessage,
    visible_at: Instant,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    in_flight: HashMap<String, InFlight>,
    dead: Vec<DeadLetterEntry>,
}

/// In-process queue for tests and single-process development.
///
/// Readiness is tracked on the tokio clock, so delayed retries and
/// redelivery of unacked messages behave under a paused test runtime.
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    next_receipt: AtomicU64,
    visibility_timeout: Duration,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            notify: Notify::new(),
            next_receipt: AtomicU64::new(0),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a delivery may stay unacked before it is handed out again.
    /// Should exceed the hard deadline.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, QueueError> {
        self.state
            .lock()
            .map_err(|e| QueueError::Command(format!("queue lock poisoned: {e}")))
    }

    /// Messages waiting to be delivered, including delayed ones.
    pub fn pending_len(&self) -> usize {
        self.lock().map(|s| s.ready.len()).unwrap_or_default()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().map(|s| s.in_flight.len()).unwrap_or_default()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.lock().map(|s| s.dead.clone()).unwrap_or_default()
    }

    /// Take an expired delivery or the first ready message, or report when
    /// the next one will be available.
    fn take_ready(&self, now: Instant) -> Result<Result<Delivery, Option<Instant>>, QueueError> {
        let mut state = self.lock()?;
        let visible_at = now + self.visibility_timeout;

        let expired = state
            .in_flight
            .iter_mut()
            .filter(|(_, entry)| entry.visible_at <= now)
            .min_by_key(|(_, entry)| entry.visible_at);
        if let Some((receipt, entry)) = expired {
            entry.visible_at = visible_at;
            entry.delivery_count += 1;
            return Ok(Ok(Delivery {
                message: entry.message.clone(),
                receipt: receipt.clone(),
                delivery_count: entry.delivery_count,
            }));
        }

        let Some(pos) = state.ready.iter().position(|p| p.ready_at <= now) else {
            let next_ready = state.ready.iter().map(|p| p.ready_at);
            let next_redelivery = state.in_flight.values().map(|e| e.visible_at);
            return Ok(Err(next_ready.chain(next_redelivery).min()));
        };
        let Some(pending) = state.ready.remove(pos) else {
            return Ok(Err(None));
        };
        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed).to_string();
        state.in_flight.insert(
            receipt.clone(),
            InFlight {
                message: pending.message.clone(),
                visible_at,
                delivery_count: 1,
            },
        );
        Ok(Ok(Delivery {
            message: pending.message,
            receipt,
            delivery_count: 1,
        }))
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), QueueError> {
        let delay = (message.not_before - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.lock()?.ready.push_back(Pending {
            ready_at: Instant::now() + delay,
            message,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            let next_ready = match self.take_ready(now)? {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(next_ready) => next_ready,
            };
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = next_ready.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.lock()?
            .in_flight
            .remove(&delivery.receipt)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownReceipt(delivery.receipt.clone()))
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), QueueError> {
        self.lock()?
            .dead
            .push(DeadLetterEntry::new(message.clone(), reason));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order_and_acks() {
        let queue = InMemoryJobQueue::new();
        let (a, b) = (JobId::new(), JobId::new());
        queue.submit(a).await.unwrap();
        queue.submit(b).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.message.job_id, a);
        assert_eq!(second.message.job_id, b);
        assert_ne!(first.receipt, second.receipt);
        assert_eq!(queue.in_flight_len(), 2);

        queue.ack(&first).await.unwrap();
        assert!(matches!(queue.ack(&first).await, Err(QueueError::UnknownReceipt(_))));
        assert_eq!(queue.in_flight_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_message_waits_for_not_before() {
        let queue = InMemoryJobQueue::new();
        let retry = QueueMessage::first(JobId::new()).next_attempt(Duration::from_secs(30));
        queue.enqueue(retry.clone()).await.unwrap();

        assert!(queue.dequeue(Duration::from_secs(10)).await.unwrap().is_none());
        assert_eq!(queue.pending_len(), 1);

        let started = Instant::now();
        let delivery = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(delivery.message, retry);
        assert!(started.elapsed() <= Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_consumer_is_woken_by_enqueue() {
        let queue = std::sync::Arc::new(InMemoryJobQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let id = JobId::new();
        queue.submit(id).await.unwrap();
        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message.job_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn unacked_delivery_is_handed_out_again() {
        let queue = InMemoryJobQueue::new().with_visibility_timeout(Duration::from_secs(60));
        let id = JobId::new();
        queue.submit(id).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert!(queue.dequeue(Duration::from_secs(30)).await.unwrap().is_none());

        let again = queue.dequeue(Duration::from_secs(60)).await.unwrap().unwrap();
        assert_eq!(again.message, first.message);
        assert_eq!(again.delivery_count, 2);
        assert_eq!(queue.in_flight_len(), 1);

        queue.ack(&again).await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert!(queue.dequeue(Duration::from_secs(120)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dead_letters_are_kept_with_reason() {
        let queue = InMemoryJobQueue::new();
        let message = QueueMessage::first(JobId::new());
        queue.dead_letter(&message, "retries exhausted").await.unwrap();

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message, message);
        assert_eq!(dead[0].reason, "retries exhausted");
    }
}
