//! Queue gateway: the I/O boundary to the topic/queue service.
//!
//! This module contains:
//! - `QueueGateway` trait: send, receive-batch, delete and dead-letter peek
//! - `Message`, `Ack`, `DeleteOutcome`: values crossing the boundary
//! - Implementations: SNS/SQS (feature `sns-sqs`), Mock
//!
//! The gateway carries no processing logic. Redelivery bookkeeping (receive
//! counts, visibility timers, dead-letter routing) belongs to the service
//! behind it.

use async_trait::async_trait;

// Implementation modules
pub mod mock;
#[cfg(feature = "sns-sqs")]
pub mod sns_sqs;

// Re-exports
pub use mock::MockQueueGateway;
#[cfg(feature = "sns-sqs")]
pub use sns_sqs::{SnsSqsConfig, SnsSqsGateway};

/// Default number of messages requested per poll.
pub const DEFAULT_MAX_MESSAGES: i32 = 10;

/// Default long-poll wait in seconds.
pub const DEFAULT_WAIT_TIME_SECS: i32 = 20;

// ============================================================================
// Types
// ============================================================================

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Transport, auth or service failures from the topic/queue service.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Delete failed: {0}")]
    Delete(String),

    #[error("Dead letter peek failed: {0}")]
    DeadLetter(String),
}

/// One delivery of a message from a queue.
///
/// A new `receipt_handle` is issued on every delivery; only the latest one
/// can delete the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Service-assigned message ID, when reported.
    pub message_id: Option<String>,
    /// Opaque text payload.
    pub body: String,
    /// Token scoping a delete to this delivery.
    pub receipt_handle: String,
    /// Approximate receive count tracked by the queue, when reported.
    pub receive_count: Option<u32>,
}

impl Message {
    /// Build a message with only a body and receipt handle.
    pub fn new(body: impl Into<String>, receipt_handle: impl Into<String>) -> Self {
        Self {
            message_id: None,
            body: body.into(),
            receipt_handle: receipt_handle.into(),
            receive_count: None,
        }
    }
}

/// Acknowledgement of a successful send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Message ID assigned by the topic, if any.
    pub message_id: Option<String>,
}

/// Result of a delete call that reached the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// The delivery was removed from the queue.
    Deleted,
    /// The receipt handle was expired or unknown. The message is already gone
    /// or has been redelivered; treat as success.
    StaleReceipt,
}

// ============================================================================
// Traits
// ============================================================================

/// Narrow interface to the managed topic/queue service.
///
/// Implementations:
/// - `SnsSqsGateway`: AWS SNS topic + SQS queues
/// - `MockQueueGateway`: in-memory simulation for tests
///
/// No method retries internally; callers decide.
#[async_trait]
pub trait QueueGateway: Send + Sync {
    /// Publish a message to a topic for fan-out.
    async fn send(&self, topic: &str, body: &str) -> Result<Ack>;

    /// Long-poll a queue for up to `max_messages`, waiting up to `wait_secs`.
    ///
    /// Returns an empty batch, not an error, when nothing arrives in time.
    async fn receive_batch(
        &self,
        queue: &str,
        max_messages: i32,
        wait_secs: i32,
    ) -> Result<Vec<Message>>;

    /// Remove the delivery bound to `receipt_handle`.
    ///
    /// An invalid or expired handle is `Ok(DeleteOutcome::StaleReceipt)`.
    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<DeleteOutcome>;

    /// Inspect up to `max_messages` dead-lettered messages without deleting them.
    async fn peek_dead_letter(&self, dlq: &str, max_messages: i32) -> Result<Vec<Message>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_new_has_no_service_metadata() {
        let message = Message::new("Hello World", "rh-1");
        assert_eq!(message.body, "Hello World");
        assert_eq!(message.receipt_handle, "rh-1");
        assert!(message.message_id.is_none());
        assert!(message.receive_count.is_none());
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::Receive("queue does not exist".to_string());
        assert_eq!(err.to_string(), "Receive failed: queue does not exist");
    }
}
