//! Best-effort publisher for topic fan-out.

use std::sync::Arc;

use tracing::{error, info};

use crate::gateway::QueueGateway;

/// Sends text messages to a topic.
///
/// Fire-and-forget: gateway errors are logged, never returned, and never
/// retried. Delivery must be confirmed from the service side.
#[derive(Clone)]
pub struct Publisher {
    gateway: Arc<dyn QueueGateway>,
}

impl Publisher {
    pub fn new(gateway: Arc<dyn QueueGateway>) -> Self {
        Self { gateway }
    }

    pub async fn publish(&self, topic: &str, text: &str) {
        match self.gateway.send(topic, text).await {
            Ok(ack) => {
                info!(topic = %topic, message_id = ?ack.message_id, body = %text, "Message published");
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to publish message");
            }
        }
    }
}
