//! Dead-letter queue inspection.
//!
//! Messages land in the dead-letter queue when the service's redrive policy
//! gives up on them (receive count above the configured maximum). This crate
//! never writes to that queue; it only peeks at it for reporting.

use tracing::info;

use crate::gateway::{Message, QueueGateway, Result};

/// Default maximum receive count before the service dead-letters a message.
///
/// Informational: the threshold is part of the queue's redrive policy.
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 3;

/// A message found in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub message_id: Option<String>,
    pub body: String,
    /// Receive count within the dead-letter queue, when reported.
    pub receive_count: Option<u32>,
}

impl From<Message> for DeadLetterRecord {
    fn from(message: Message) -> Self {
        Self {
            message_id: message.message_id,
            body: message.body,
            receive_count: message.receive_count,
        }
    }
}

/// Peek at up to `max_messages` dead-lettered messages and log them.
pub async fn inspect_dead_letters(
    gateway: &dyn QueueGateway,
    dlq: &str,
    max_messages: i32,
) -> Result<Vec<DeadLetterRecord>> {
    let records: Vec<DeadLetterRecord> = gateway
        .peek_dead_letter(dlq, max_messages)
        .await?
        .into_iter()
        .map(DeadLetterRecord::from)
        .collect();

    info!(dlq = %dlq, count = records.len(), "Messages in dead letter queue");
    for record in &records {
        info!(message_id = ?record.message_id, body = %record.body, "Dead letter");
    }

    Ok(records)
}
