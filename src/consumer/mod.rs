//! Consumption loop.
//!
//! Polls a queue through the gateway, classifies each message, deletes the
//! ones that succeed and leaves the rest unacknowledged. Unacknowledged
//! messages reappear after the queue's visibility timeout and are moved to the
//! dead-letter queue by the service once its receive threshold is exceeded.
//!
//! ## States
//!
//! ```text
//! Running --(stop seen at a checkpoint)--> Draining --> Stopped
//! ```
//!
//! Checkpoints:
//! - (a) before each `receive_batch`
//! - (b) before each message of a batch in hand
//!
//! A poll already blocked in its long-poll wait is never interrupted, so the
//! worst-case shutdown latency is the wait time plus the message in hand.
//! The pause after a failed poll ends as soon as a stop is requested.
//! No error ends the loop; only the shutdown signal does.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classifier, Outcome};
use crate::gateway::{
    DeleteOutcome, Message, QueueGateway, DEFAULT_MAX_MESSAGES, DEFAULT_WAIT_TIME_SECS,
};
use crate::shutdown::ShutdownSignal;

/// Default pause after a failed poll.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Errors surfaced to the controller when waiting for the loop.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Consumer task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Loop lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    /// Shutdown observed; finishing the current cycle without polling again.
    Draining,
    Stopped,
}

/// Polling parameters for one queue.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Queue to poll.
    pub queue_id: String,
    /// Max number of messages to receive in one poll (default: 10).
    pub max_messages: i32,
    /// Wait time seconds for long polling (default: 20).
    pub wait_time_secs: i32,
    /// Pause after a failed poll before returning to checkpoint (a).
    /// Cut short by a stop request.
    pub error_backoff: Duration,
}

impl ConsumerConfig {
    pub fn new(queue_id: impl Into<String>) -> Self {
        Self {
            queue_id: queue_id.into(),
            max_messages: DEFAULT_MAX_MESSAGES,
            wait_time_secs: DEFAULT_WAIT_TIME_SECS,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    pub fn with_max_messages(mut self, max_messages: i32) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_wait_time(mut self, secs: i32) -> Self {
        self.wait_time_secs = secs;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Counters accumulated over a loop's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// `receive_batch` calls issued.
    pub polls: u64,
    /// `receive_batch` calls that failed.
    pub receive_errors: u64,
    /// Messages received.
    pub received: u64,
    /// Messages classified as success and deleted.
    pub acknowledged: u64,
    /// Successful messages whose receipt had already gone stale.
    pub stale_receipts: u64,
    /// Messages classified as failure and left for redelivery.
    pub failed: u64,
    /// Successful messages whose delete failed; left for redelivery.
    pub delete_errors: u64,
    /// Messages left untouched because shutdown began mid-batch.
    pub skipped: u64,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Disposition {
    Acknowledged,
    StaleReceipt,
    Failed,
    DeleteFailed,
}

/// Single-queue consumption loop.
pub struct ConsumptionLoop {
    gateway: Arc<dyn QueueGateway>,
    classifier: Arc<dyn Classifier>,
    config: ConsumerConfig,
    shutdown: ShutdownSignal,
    state: LoopState,
    report: ConsumerReport,
}

impl ConsumptionLoop {
    pub fn new(
        gateway: Arc<dyn QueueGateway>,
        classifier: Arc<dyn Classifier>,
        config: ConsumerConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            gateway,
            classifier,
            config,
            shutdown,
            state: LoopState::Running,
            report: ConsumerReport::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn report(&self) -> &ConsumerReport {
        &self.report
    }

    /// Run the loop on a tokio task.
    pub fn spawn(self) -> ConsumerHandle {
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(self.run());
        ConsumerHandle { shutdown, task }
    }

    /// Drive the state machine until `Stopped`.
    pub async fn run(mut self) -> ConsumerReport {
        info!(
            queue = %self.config.queue_id,
            max_messages = self.config.max_messages,
            wait_time_secs = self.config.wait_time_secs,
            "Starting message processing"
        );

        while self.step().await != LoopState::Stopped {}

        info!(
            queue = %self.config.queue_id,
            polls = self.report.polls,
            acknowledged = self.report.acknowledged,
            failed = self.report.failed,
            skipped = self.report.skipped,
            "Message processing stopped"
        );
        self.report
    }

    /// Execute one cycle and return the resulting state.
    pub async fn step(&mut self) -> LoopState {
        match self.state {
            LoopState::Running => {
                // Checkpoint (a)
                if self.shutdown.is_stop_requested() {
                    debug!("Stop observed before poll");
                    self.state = LoopState::Draining;
                } else {
                    self.poll_and_process().await;
                }
            }
            LoopState::Draining => {
                self.state = LoopState::Stopped;
            }
            LoopState::Stopped => {}
        }
        self.state
    }

    async fn poll_and_process(&mut self) {
        let queue = self.config.queue_id.clone();
        self.report.polls += 1;

        let batch = match self
            .gateway
            .receive_batch(&queue, self.config.max_messages, self.config.wait_time_secs)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                self.report.receive_errors += 1;
                error!(queue = %queue, error = %e, "Failed to receive messages");
                if !self.config.error_backoff.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                        _ = self.shutdown.stopped() => {
                            debug!(queue = %queue, "Stop observed during error backoff");
                        }
                    }
                }
                return;
            }
        };

        if batch.is_empty() {
            debug!(queue = %queue, "No messages received");
            return;
        }

        debug!(queue = %queue, count = batch.len(), "Received batch");
        self.report.received += batch.len() as u64;

        let mut pending = batch.into_iter();
        while let Some(message) = pending.next() {
            // Checkpoint (b)
            if self.shutdown.is_stop_requested() {
                let skipped = 1 + pending.len() as u64;
                self.report.skipped += skipped;
                self.state = LoopState::Draining;
                info!(
                    queue = %queue,
                    skipped = skipped,
                    "Stop requested mid-batch, leaving remaining messages for redelivery"
                );
                return;
            }

            match self.process(&queue, &message).await {
                Disposition::Acknowledged => self.report.acknowledged += 1,
                Disposition::StaleReceipt => self.report.stale_receipts += 1,
                Disposition::Failed => self.report.failed += 1,
                Disposition::DeleteFailed => self.report.delete_errors += 1,
            }
        }
    }

    async fn process(&self, queue: &str, message: &Message) -> Disposition {
        info!(
            message_id = ?message.message_id,
            receive_count = ?message.receive_count,
            body = %message.body,
            "Processing message"
        );

        match self.classify(message) {
            Outcome::Success => {}
            Outcome::Failure(failure) => {
                warn!(
                    message_id = ?message.message_id,
                    receive_count = ?message.receive_count,
                    error = %failure,
                    "Error processing message, leaving for redelivery"
                );
                return Disposition::Failed;
            }
        }

        match self.gateway.delete(queue, &message.receipt_handle).await {
            Ok(DeleteOutcome::Deleted) => {
                debug!(message_id = ?message.message_id, "Message acknowledged");
                Disposition::Acknowledged
            }
            Ok(DeleteOutcome::StaleReceipt) => {
                warn!(
                    message_id = ?message.message_id,
                    receipt_handle = %message.receipt_handle,
                    "Receipt handle stale, message already removed or redelivered"
                );
                Disposition::StaleReceipt
            }
            Err(e) => {
                error!(
                    message_id = ?message.message_id,
                    error = %e,
                    "Failed to delete processed message, it will be redelivered"
                );
                Disposition::DeleteFailed
            }
        }
    }

    /// Classify, turning a panicking classifier into a failure.
    fn classify(&self, message: &Message) -> Outcome {
        match catch_unwind(AssertUnwindSafe(|| self.classifier.classify(message))) {
            Ok(outcome) => outcome,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Outcome::failure(format!("classifier panicked: {}", detail))
            }
        }
    }
}

/// Controller-side handle to a spawned loop.
pub struct ConsumerHandle {
    shutdown: ShutdownSignal,
    task: JoinHandle<ConsumerReport>,
}

impl ConsumerHandle {
    /// Request a stop. Idempotent.
    pub fn signal_stop(&self) -> bool {
        self.shutdown.signal_stop()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.shutdown.is_stop_requested()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the loop task has exited.
    ///
    /// Does not request a stop and has no timeout; call `signal_stop` first.
    pub async fn await_stopped(self) -> Result<ConsumerReport, ConsumerError> {
        Ok(self.task.await?)
    }

    /// Signal and wait.
    pub async fn stop(self) -> Result<ConsumerReport, ConsumerError> {
        self.signal_stop();
        self.await_stopped().await
    }
}
