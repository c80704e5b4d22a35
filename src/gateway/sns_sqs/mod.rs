//! AWS SNS/SQS queue gateway.
//!
//! Publishes to an SNS topic and consumes from SQS queues subscribed to it.
//! Resources are identified by the SNS topic ARN and SQS queue URLs; they are
//! provisioned outside this crate, together with the main queue's redrive
//! policy that moves repeatedly failing messages to the dead-letter queue.
//!
//! Subscriptions without raw message delivery wrap bodies in an SNS
//! notification envelope. Received bodies are unwrapped so payloads
//! round-trip unchanged either way.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sns::Client as SnsClient;
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client as SqsClient;
use backon::Retryable;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Ack, DeleteOutcome, GatewayError, Message, QueueGateway, Result};
use crate::utils::retry::connection_backoff;

/// Configuration for AWS SNS/SQS connection.
#[derive(Clone, Debug, Default)]
pub struct SnsSqsConfig {
    /// AWS region (e.g., "us-east-2"). Uses default provider chain if not set.
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack or testing).
    pub endpoint_url: Option<String>,
}

impl SnsSqsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set AWS region.
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set custom endpoint URL (for LocalStack or testing).
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint_url = Some(url.into());
        self
    }
}

/// Redrive policy attached to a source queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_target_arn: String,
    pub max_receive_count: u32,
}

/// Parse an SQS `RedrivePolicy` attribute.
///
/// `maxReceiveCount` is accepted as a number or a numeric string; AWS returns both.
pub fn parse_redrive_policy(json: &str) -> Option<RedrivePolicy> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let dead_letter_target_arn = value.get("deadLetterTargetArn")?.as_str()?.to_string();
    let count = value.get("maxReceiveCount")?;
    let max_receive_count = count
        .as_u64()
        .or_else(|| count.as_str().and_then(|s| s.parse().ok()))
        .and_then(|c| u32::try_from(c).ok())?;

    Some(RedrivePolicy {
        dead_letter_target_arn,
        max_receive_count,
    })
}

#[derive(Deserialize)]
struct SnsEnvelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message")]
    message: String,
}

/// Extract the published text from an SNS notification envelope.
///
/// Returns `None` for bodies that are not an envelope.
pub fn unwrap_sns_envelope(body: &str) -> Option<String> {
    if !body.trim_start().starts_with('{') {
        return None;
    }
    serde_json::from_str::<SnsEnvelope>(body)
        .ok()
        .filter(|envelope| envelope.kind == "Notification")
        .map(|envelope| envelope.message)
}

fn convert_message(message: &aws_sdk_sqs::types::Message) -> Option<Message> {
    let Some(receipt_handle) = message.receipt_handle() else {
        warn!(message_id = ?message.message_id(), "SQS message without receipt handle, skipping");
        return None;
    };

    let raw = message.body().unwrap_or_default();
    let body = unwrap_sns_envelope(raw).unwrap_or_else(|| raw.to_string());

    let receive_count = message
        .attributes()
        .and_then(|attrs| attrs.get(&MessageSystemAttributeName::ApproximateReceiveCount))
        .and_then(|v| v.parse().ok());

    Some(Message {
        message_id: message.message_id().map(str::to_string),
        body,
        receipt_handle: receipt_handle.to_string(),
        receive_count,
    })
}

/// AWS SNS/SQS gateway implementation.
#[derive(Clone)]
pub struct SnsSqsGateway {
    sns: SnsClient,
    sqs: SqsClient,
}

impl SnsSqsGateway {
    /// Create a new SNS/SQS gateway.
    pub async fn new(config: SnsSqsConfig) -> Result<Self> {
        // Load AWS config
        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region) = config.region {
            aws_config_builder =
                aws_config_builder.region(aws_config::Region::new(region.clone()));
        }

        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        if aws_config.region().is_none() {
            return Err(GatewayError::Connection(
                "No AWS region configured (set aws.region or AWS_REGION)".to_string(),
            ));
        }

        let sns = SnsClient::new(&aws_config);
        let sqs = SqsClient::new(&aws_config);

        info!(
            region = ?config.region,
            endpoint = ?config.endpoint_url,
            "Connected to AWS SNS/SQS"
        );

        Ok(Self { sns, sqs })
    }

    /// Confirm the topic and both queues are reachable, retrying with backoff.
    ///
    /// Returns the main queue's redrive policy, if it has one.
    pub async fn verify(&self, topic: &str, queue: &str, dlq: &str) -> Result<Option<RedrivePolicy>> {
        (move || self.check_topic(topic))
            .retry(connection_backoff())
            .notify(|err: &GatewayError, dur: Duration| {
                warn!(topic = %topic, error = %err, delay = ?dur, "Topic check failed, retrying");
            })
            .await?;

        let policy = (move || self.redrive_policy(queue))
            .retry(connection_backoff())
            .notify(|err: &GatewayError, dur: Duration| {
                warn!(queue = %queue, error = %err, delay = ?dur, "Queue check failed, retrying");
            })
            .await?;

        (move || self.redrive_policy(dlq))
            .retry(connection_backoff())
            .notify(|err: &GatewayError, dur: Duration| {
                warn!(queue = %dlq, error = %err, delay = ?dur, "Dead letter queue check failed, retrying");
            })
            .await?;

        info!(topic = %topic, queue = %queue, dlq = %dlq, "Verified SNS/SQS resources");
        Ok(policy)
    }

    async fn check_topic(&self, topic: &str) -> Result<()> {
        self.sns
            .get_topic_attributes()
            .topic_arn(topic)
            .send()
            .await
            .map_err(|e| {
                GatewayError::Connection(format!(
                    "Failed to read SNS topic attributes: {}",
                    DisplayErrorContext(&e)
                ))
            })?;
        Ok(())
    }

    async fn redrive_policy(&self, queue: &str) -> Result<Option<RedrivePolicy>> {
        let output = self
            .sqs
            .get_queue_attributes()
            .queue_url(queue)
            .attribute_names(QueueAttributeName::RedrivePolicy)
            .send()
            .await
            .map_err(|e| {
                GatewayError::Connection(format!(
                    "Failed to read SQS queue attributes: {}",
                    DisplayErrorContext(&e)
                ))
            })?;

        Ok(output
            .attributes()
            .and_then(|attrs| attrs.get(&QueueAttributeName::RedrivePolicy))
            .and_then(|json| parse_redrive_policy(json)))
    }

    async fn receive(
        &self,
        queue: &str,
        max_messages: i32,
        wait_secs: i32,
        visibility_timeout: Option<i32>,
    ) -> std::result::Result<Vec<Message>, String> {
        let output = self
            .sqs
            .receive_message()
            .queue_url(queue)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_secs)
            .set_visibility_timeout(visibility_timeout)
            .message_system_attribute_names(MessageSystemAttributeName::ApproximateReceiveCount)
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;

        Ok(output.messages().iter().filter_map(convert_message).collect())
    }
}

#[async_trait]
impl QueueGateway for SnsSqsGateway {
    async fn send(&self, topic: &str, body: &str) -> Result<Ack> {
        let output = self
            .sns
            .publish()
            .topic_arn(topic)
            .message(body)
            .send()
            .await
            .map_err(|e| {
                GatewayError::Send(format!("Failed to publish to SNS: {}", DisplayErrorContext(&e)))
            })?;

        debug!(topic = %topic, message_id = ?output.message_id(), "Published message to SNS");

        Ok(Ack {
            message_id: output.message_id().map(str::to_string),
        })
    }

    async fn receive_batch(
        &self,
        queue: &str,
        max_messages: i32,
        wait_secs: i32,
    ) -> Result<Vec<Message>> {
        let messages = self
            .receive(queue, max_messages, wait_secs, None)
            .await
            .map_err(|e| GatewayError::Receive(format!("Failed to receive from SQS: {}", e)))?;

        debug!(queue = %queue, count = messages.len(), "Received messages from SQS");
        Ok(messages)
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> Result<DeleteOutcome> {
        match self
            .sqs
            .delete_message()
            .queue_url(queue)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) => {
                let stale = e
                    .as_service_error()
                    .map(|se| se.is_receipt_handle_is_invalid() || se.is_invalid_id_format())
                    .unwrap_or(false);

                if stale {
                    debug!(queue = %queue, "Receipt handle no longer valid");
                    Ok(DeleteOutcome::StaleReceipt)
                } else {
                    Err(GatewayError::Delete(format!(
                        "Failed to delete SQS message: {}",
                        DisplayErrorContext(&e)
                    )))
                }
            }
        }
    }

    async fn peek_dead_letter(&self, dlq: &str, max_messages: i32) -> Result<Vec<Message>> {
        // Zero visibility keeps peeked messages available to any other reader.
        self.receive(dlq, max_messages, 0, Some(0))
            .await
            .map_err(|e| GatewayError::DeadLetter(format!("Failed to peek SQS DLQ: {}", e)))
    }
}
