//! fanout-worker: SNS/SQS message processor
//!
//! Publishes the configured startup messages to the topic, consumes the
//! subscribed queue until Ctrl+C (or the configured run window), then reports
//! what ended up in the dead-letter queue.
//!
//! ## Architecture
//! ```text
//! [publisher] --> SNS topic --> SQS queue --> [consumption loop] --delete on success
//!                                   |
//!                                   +--(max receives exceeded)--> SQS DLQ --> [report]
//! ```
//!
//! ## Configuration
//! - TOPIC_ID, QUEUE_ID, DLQ_ID: topic ARN and queue URLs
//! - FANOUT_CONFIG or --config: YAML configuration file
//! - FANOUT_LOG: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use fanout_worker::classifier::MarkerClassifier;
use fanout_worker::config::Config;
use fanout_worker::consumer::ConsumptionLoop;
use fanout_worker::dlq::inspect_dead_letters;
use fanout_worker::gateway::{QueueGateway, SnsSqsConfig, SnsSqsGateway};
use fanout_worker::publisher::Publisher;
use fanout_worker::shutdown::ShutdownSignal;
use fanout_worker::utils::bootstrap::{init_tracing, parse_config_path};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    config.validate()?;
    let resources = config.resources()?;

    info!(
        topic = %resources.topic_id,
        queue = %resources.queue_id,
        dlq = %resources.dlq_id,
        "Starting fanout-worker"
    );

    let mut sns_sqs = SnsSqsConfig::new();
    if let Some(ref region) = config.aws.region {
        sns_sqs = sns_sqs.with_region(region);
    }
    if let Some(ref endpoint) = config.aws.endpoint_url {
        sns_sqs = sns_sqs.with_endpoint(endpoint);
    }

    let sns_sqs = SnsSqsGateway::new(sns_sqs).await?;
    let policy = sns_sqs
        .verify(&resources.topic_id, &resources.queue_id, &resources.dlq_id)
        .await?;
    match policy {
        Some(policy) if policy.max_receive_count != config.dead_letter.max_receive_count => {
            warn!(
                expected = config.dead_letter.max_receive_count,
                actual = policy.max_receive_count,
                "Queue redrive threshold differs from configuration"
            );
        }
        Some(policy) => {
            info!(
                dlq_arn = %policy.dead_letter_target_arn,
                max_receive_count = policy.max_receive_count,
                "Queue redrive policy"
            );
        }
        None => {
            warn!(queue = %resources.queue_id, "Queue has no redrive policy, failed messages will never be dead-lettered");
        }
    }
    let gateway: Arc<dyn QueueGateway> = Arc::new(sns_sqs);

    let publisher = Publisher::new(gateway.clone());
    for text in &config.run.startup_messages {
        publisher.publish(&resources.topic_id, text).await;
    }

    let shutdown = ShutdownSignal::new();
    let handle = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::new(config.consumer.failure_marker.clone())),
        config.consumer_config(&resources),
        shutdown.clone(),
    )
    .spawn();

    match config.run.window_secs {
        Some(secs) => {
            info!(window_secs = secs, "Worker running, press Ctrl+C to exit early");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                result = tokio::signal::ctrl_c() => result?,
            }
        }
        None => {
            info!("Worker running, press Ctrl+C to exit");
            tokio::signal::ctrl_c().await?;
        }
    }

    shutdown.signal_stop();
    let report = handle.await_stopped().await?;
    info!(
        polls = report.polls,
        received = report.received,
        acknowledged = report.acknowledged,
        failed = report.failed,
        skipped = report.skipped,
        receive_errors = report.receive_errors,
        delete_errors = report.delete_errors,
        "Consumer report"
    );

    if let Err(e) = inspect_dead_letters(
        gateway.as_ref(),
        &resources.dlq_id,
        config.dead_letter.peek_max_messages,
    )
    .await
    {
        error!(error = %e, "Failed to inspect dead letter queue");
    }

    info!("Application shutdown");
    Ok(())
}
