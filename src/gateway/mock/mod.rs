//! Mock queue gateway for testing.
//!
//! Simulates the parts of a managed topic/queue service that the consumer
//! depends on:
//! - topics fan out to every subscribed queue
//! - a received message is hidden for the visibility timeout and gets a
//!   fresh receipt handle (older handles go stale)
//! - a queue with a redrive policy moves a message to its dead-letter queue
//!   once a receive finds `receive_count >= max_receive_count`
//! - `receive_batch` long-polls up to `wait_secs`

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::{Ack, DeleteOutcome, GatewayError, Message, QueueGateway, Result};

/// Re-check interval while long-polling, so expiring visibility timeouts are noticed.
const POLL_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Redrive {
    dlq: String,
    max_receive_count: u32,
}

#[derive(Debug)]
struct StoredMessage {
    message_id: String,
    body: String,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn new(body: String) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            body,
            receive_count: 0,
            visible_at: Instant::now(),
            receipt_handle: None,
        }
    }
}

#[derive(Debug, Default)]
struct StoredQueue {
    messages: VecDeque<StoredMessage>,
    redrive: Option<Redrive>,
}

#[derive(Debug, Default)]
struct State {
    subscriptions: HashMap<String, Vec<String>>,
    queues: HashMap<String, StoredQueue>,
    sent: Vec<(String, String)>,
    deleted: Vec<String>,
    receive_calls: usize,
    fail_on_send: bool,
    fail_on_delete: bool,
    failing_receives: usize,
}

/// Mock gateway for testing.
pub struct MockQueueGateway {
    state: Mutex<State>,
    arrivals: Notify,
    visibility_timeout: Duration,
}

impl Default for MockQueueGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockQueueGateway {
    /// Create a mock with a 30 second visibility timeout.
    pub fn new() -> Self {
        Self::with_visibility_timeout(Duration::from_secs(30))
    }

    /// Create a mock with a custom visibility timeout.
    ///
    /// A zero timeout makes unacknowledged messages immediately receivable again.
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            arrivals: Notify::new(),
            visibility_timeout,
        }
    }

    /// Create a queue if it does not exist.
    pub async fn create_queue(&self, queue: &str) {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
    }

    /// Subscribe a queue to a topic, creating both as needed.
    pub async fn subscribe(&self, topic: &str, queue: &str) {
        let mut state = self.state.lock().await;
        state.queues.entry(queue.to_string()).or_default();
        let queues = state.subscriptions.entry(topic.to_string()).or_default();
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
    }

    /// Route messages from `queue` to `dlq` after `max_receive_count` receives.
    pub async fn set_redrive(&self, queue: &str, dlq: &str, max_receive_count: u32) {
        let mut state = self.state.lock().await;
        state.queues.entry(dlq.to_string()).or_default();
        state.queues.entry(queue.to_string()).or_default().redrive = Some(Redrive {
            dlq: dlq.to_string(),
            max_receive_count,
        });
    }

    /// Put a message directly on a queue, bypassing any topic.
    pub async fn enqueue(&self, queue: &str, body: impl Into<String>) {
        let mut state = self.state.lock().await;
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .messages
            .push_back(StoredMessage::new(body.into()));
        drop(state);
        self.arrivals.notify_waiters();
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        self.state.lock().await.fail_on_send = fail;
    }

    pub async fn set_fail_on_delete(&self, fail: bool) {
        self.state.lock().await.fail_on_delete = fail;
    }

    /// Make the next `count` receive calls fail.
    pub async fn fail_next_receives(&self, count: usize) {
        self.state.lock().await.failing_receives = count;
    }

    /// Number of `receive_batch` calls made so far, failed ones included.
    pub async fn receive_calls(&self) -> usize {
        self.state.lock().await.receive_calls
    }

    /// Receipt handles that removed a message, in call order.
    pub async fn deleted_receipts(&self) -> Vec<String> {
        self.state.lock().await.deleted.clone()
    }

    /// `(topic, body)` pairs accepted by `send`.
    pub async fn sent_messages(&self) -> Vec<(String, String)> {
        self.state.lock().await.sent.clone()
    }

    /// Messages stored on a queue, visible or in flight.
    pub async fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Take up to `max` visible messages from a queue, applying redrive.
    ///
    /// Returns `None` when the queue does not exist.
    fn take_visible(&self, state: &mut State, queue: &str, max: usize) -> Option<Vec<Message>> {
        let now = Instant::now();
        let visibility_timeout = self.visibility_timeout;
        let stored = state.queues.get_mut(queue)?;
        let redrive = stored.redrive.clone();

        let mut batch = Vec::new();
        let mut dead = Vec::new();
        let mut index = 0;
        while index < stored.messages.len() && batch.len() < max {
            let message = &mut stored.messages[index];
            if message.visible_at > now {
                index += 1;
                continue;
            }

            if let Some(ref redrive) = redrive {
                if message.receive_count >= redrive.max_receive_count {
                    if let Some(moved) = stored.messages.remove(index) {
                        dead.push(moved);
                    }
                    continue;
                }
            }

            let receipt = Uuid::new_v4().to_string();
            message.receive_count += 1;
            message.visible_at = now + visibility_timeout;
            message.receipt_handle = Some(receipt.clone());
            batch.push(Message {
                message_id: Some(message.message_id.clone()),
                body: message.body.clone(),
                receipt_handle: receipt,
                receive_count: Some(message.receive_count),
            });
            index += 1;
        }

        if let Some(redrive) = redrive {
            for mut moved in dead {
                debug!(
                    queue = %queue,
                    dlq = %redrive.dlq,
                    message_id = %moved.message_id,
                    receive_count = moved.receive_count,
                    "Moving message to dead letter queue"
                );
                moved.receive_count = 0;
                moved.visible_at = now;
                moved.receipt_handle = None;
                state
                    .queues
                    .entry(redrive.dlq.clone())
                    .or_default()
                    .messages
                    .push_back(moved);
            }
        }

        Some(batch)
    }
}

#[async_trait]
impl QueueGateway for MockQueueGateway {
    async fn send(&self, topic: &str, body: &str) -> Result<Ack> {
        let mut state = self.state.lock().await;
        if state.fail_on_send {
            return Err(GatewayError::Send("Mock send failure".to_string()));
        }

        let queues = state
            .subscriptions
            .get(topic)
            .cloned()
            .ok_or_else(|| GatewayError::Send(format!("Topic does not exist: {}", topic)))?;

        let message_id = Uuid::new_v4().to_string();
        for queue in queues {
            state
                .queues
                .entry(queue)
                .or_default()
                .messages
                .push_back(StoredMessage::new(body.to_string()));
        }
        state.sent.push((topic.to_string(), body.to_string()));
        drop(state);

        self.arrivals.notify_waiters();
        Ok(Ack {
            message_id: Some(message_id),
        })
    }

    async fn receive_batch(
        &self,
        queue: &str,
        max_messages: i32,
        wait_secs: i32,
    ) -> Result<Vec<Message>> {
        let max = usize::try_from(max_messages.max(1)).unwrap_or(1);
        let deadline = Instant::now() + Duration::from_secs(u64::try_from(wait_secs).unwrap_or(0));

        {
            let mut state = self.state.lock().await;
            state.receive_calls += 1;
            if state.failing_receives > 0 {
                state.failing_receives -= 1;
                return Err(GatewayError::Receive("Mock receive failure".to_string()));
            }
        }

        loop {
            let notified = self.arrivals.notified();
            {
                let mut state = self.state.lock().await;
                let batch = self.take_visible(&mut state, queue, max).ok_or_else(|| {
                    GatewayError::Receive(format!("Queue does not exist: {}", queue))
                })?;
                if !batch.is_empty() || Instant::now() >= deadline {
                    return Ok(batch);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let _ = tokio::time::timeout(remaining.min(POLL_TICK), notified).await;
        }
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock().await;
        if state.fail_on_delete {
            return Err(GatewayError::Delete("Mock delete failure".to_string()));
        }

        let stored = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| GatewayError::Delete(format!("Queue does not exist: {}", queue)))?;

        let position = stored
            .messages
            .iter()
            .position(|m| m.receipt_handle.as_deref() == Some(receipt_handle));

        match position {
            Some(index) => {
                stored.messages.remove(index);
                state.deleted.push(receipt_handle.to_string());
                Ok(DeleteOutcome::Deleted)
            }
            None => Ok(DeleteOutcome::StaleReceipt),
        }
    }

    async fn peek_dead_letter(&self, dlq: &str, max_messages: i32) -> Result<Vec<Message>> {
        let max = usize::try_from(max_messages.max(1)).unwrap_or(1);
        let state = self.state.lock().await;
        let stored = state
            .queues
            .get(dlq)
            .ok_or_else(|| GatewayError::DeadLetter(format!("Queue does not exist: {}", dlq)))?;

        Ok(stored
            .messages
            .iter()
            .take(max)
            .map(|m| Message {
                message_id: Some(m.message_id.clone()),
                body: m.body.clone(),
                receipt_handle: Uuid::new_v4().to_string(),
                receive_count: Some(m.receive_count),
            })
            .collect())
    }
}
