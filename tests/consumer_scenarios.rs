//! End-to-end consumer scenarios against the in-memory gateway.
//!
//! Run with: cargo test --test consumer_scenarios

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fanout_worker::classifier::{Classifier, MarkerClassifier, Outcome};
use fanout_worker::consumer::{ConsumerConfig, ConsumptionLoop, LoopState};
use fanout_worker::dlq::inspect_dead_letters;
use fanout_worker::gateway::{DeleteOutcome, Message, MockQueueGateway, QueueGateway};
use fanout_worker::publisher::Publisher;
use fanout_worker::shutdown::ShutdownSignal;

const TOPIC: &str = "MyTopic";
const QUEUE: &str = "MainQueue";
const DLQ: &str = "DeadLetterQueue";

/// Topic fanned out to the main queue, which redrives to the DLQ after 3 receives.
async fn provisioned(visibility: Duration) -> Arc<MockQueueGateway> {
    let gateway = Arc::new(MockQueueGateway::with_visibility_timeout(visibility));
    gateway.subscribe(TOPIC, QUEUE).await;
    gateway.set_redrive(QUEUE, DLQ, 3).await;
    gateway
}

fn immediate_config() -> ConsumerConfig {
    ConsumerConfig::new(QUEUE)
        .with_wait_time(0)
        .with_error_backoff(Duration::ZERO)
}

/// Classifier that counts calls before delegating to the marker rule.
struct CountingClassifier {
    calls: Arc<AtomicUsize>,
    inner: MarkerClassifier,
}

impl Classifier for CountingClassifier {
    fn classify(&self, message: &Message) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.classify(message)
    }
}

#[tokio::test]
async fn test_scenario_a_publish_hello_world() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    let publisher = Publisher::new(gateway.clone());

    publisher.publish(TOPIC, "Hello World").await;

    assert_eq!(
        gateway.sent_messages().await,
        vec![(TOPIC.to_string(), "Hello World".to_string())]
    );
}

#[tokio::test]
async fn test_scenario_a_publish_failure_does_not_surface() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    gateway.set_fail_on_send(true).await;
    let publisher = Publisher::new(gateway.clone());

    // Returns normally even though the gateway rejects the send.
    publisher.publish(TOPIC, "Hello World").await;

    assert_eq!(gateway.queue_depth(QUEUE).await, 0);
}

#[tokio::test]
async fn test_scenario_b_mixed_batch() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    let publisher = Publisher::new(gateway.clone());
    for body in ["ok1", "has error", "ok2"] {
        publisher.publish(TOPIC, body).await;
    }

    let mut consumer = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::default()),
        immediate_config(),
        ShutdownSignal::new(),
    );

    assert_eq!(consumer.step().await, LoopState::Running);
    assert_eq!(gateway.deleted_receipts().await.len(), 2);
    assert_eq!(gateway.queue_depth(QUEUE).await, 1);

    // The loop keeps polling afterwards.
    assert_eq!(consumer.step().await, LoopState::Running);
    assert_eq!(gateway.receive_calls().await, 2);
    assert_eq!(consumer.report().acknowledged, 2);
    assert_eq!(consumer.report().failed, 1);
}

#[tokio::test]
async fn test_scenario_c_stop_during_second_message() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    gateway.enqueue(QUEUE, "first").await;
    gateway.enqueue(QUEUE, "second").await;

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order = seen.clone();
    let classifier = move |message: &Message| {
        if let Ok(mut order) = order.lock() {
            order.push(message.body.clone());
        }
        if message.body == "second" {
            // Stop arrives while the second message is being processed.
            signal.signal_stop();
        }
        Outcome::Success
    };

    let mut consumer =
        ConsumptionLoop::new(gateway.clone(), Arc::new(classifier), immediate_config(), shutdown);

    // The batch finishes, then checkpoint (a) sees the stop.
    assert_eq!(consumer.step().await, LoopState::Running);
    assert_eq!(consumer.step().await, LoopState::Draining);
    assert_eq!(consumer.step().await, LoopState::Stopped);

    assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    assert_eq!(gateway.deleted_receipts().await.len(), 2);
    assert_eq!(gateway.receive_calls().await, 1);
    assert_eq!(consumer.report().skipped, 0);
}

#[tokio::test]
async fn test_scenario_d_empty_poll() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let mut consumer = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(CountingClassifier {
            calls: calls.clone(),
            inner: MarkerClassifier::default(),
        }),
        immediate_config(),
        ShutdownSignal::new(),
    );

    assert_eq!(consumer.step().await, LoopState::Running);
    assert_eq!(consumer.step().await, LoopState::Running);

    assert_eq!(gateway.receive_calls().await, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(gateway.deleted_receipts().await.is_empty());
}

#[tokio::test]
async fn test_delete_is_idempotent_for_the_loop() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    gateway.enqueue(QUEUE, "ok").await;
    let batch = gateway.receive_batch(QUEUE, 10, 0).await.unwrap();
    let receipt = &batch[0].receipt_handle;

    assert_eq!(gateway.delete(QUEUE, receipt).await.unwrap(), DeleteOutcome::Deleted);
    assert_eq!(
        gateway.delete(QUEUE, receipt).await.unwrap(),
        DeleteOutcome::StaleReceipt
    );
}

#[tokio::test]
async fn test_failed_message_is_never_deleted_and_reaches_dead_letter_queue() {
    let gateway = provisioned(Duration::ZERO).await;
    let publisher = Publisher::new(gateway.clone());
    publisher.publish(TOPIC, "This message has error").await;

    let mut consumer = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::default()),
        immediate_config(),
        ShutdownSignal::new(),
    );

    // Three failed deliveries, then the fourth receive redrives it.
    for _ in 0..4 {
        consumer.step().await;
    }

    assert!(gateway.deleted_receipts().await.is_empty());
    assert_eq!(consumer.report().failed, 3);
    assert_eq!(gateway.queue_depth(QUEUE).await, 0);

    let records = inspect_dead_letters(gateway.as_ref(), DLQ, 10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].body, "This message has error");
}

#[tokio::test]
async fn test_reference_run_publishes_processes_and_reports() {
    let gateway = provisioned(Duration::ZERO).await;
    let publisher = Publisher::new(gateway.clone());
    for body in ["Hello World", "This message has error", "Another message"] {
        publisher.publish(TOPIC, body).await;
    }

    let handle = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::default()),
        ConsumerConfig::new(QUEUE)
            .with_wait_time(1)
            .with_error_backoff(Duration::ZERO),
        ShutdownSignal::new(),
    )
    .spawn();

    tokio::time::timeout(Duration::from_secs(5), async {
        while gateway.queue_depth(QUEUE).await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("main queue never drained");

    let report = handle.stop().await.unwrap();
    assert_eq!(report.acknowledged, 2);
    assert_eq!(report.failed, 3);

    let records = inspect_dead_letters(gateway.as_ref(), DLQ, 10).await.unwrap();
    let bodies: Vec<_> = records.iter().map(|r| r.body.as_str()).collect();
    assert_eq!(bodies, vec!["This message has error"]);
}

#[tokio::test]
async fn test_shutdown_latency_bounded_by_wait_time() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    let handle = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::default()),
        ConsumerConfig::new(QUEUE).with_wait_time(1),
        ShutdownSignal::new(),
    )
    .spawn();

    // Let the loop block in a long poll.
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.signal_stop();
    let calls_at_stop = gateway.receive_calls().await;

    let report = tokio::time::timeout(Duration::from_secs(3), handle.await_stopped())
        .await
        .expect("loop did not stop within wait time")
        .unwrap();

    assert_eq!(gateway.receive_calls().await, calls_at_stop);
    assert_eq!(report.polls as usize, calls_at_stop);
}

#[tokio::test]
async fn test_independent_loops_have_independent_signals() {
    let gateway = provisioned(Duration::from_secs(30)).await;
    gateway.create_queue("OtherQueue").await;

    let first = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::default()),
        ConsumerConfig::new(QUEUE).with_wait_time(1),
        ShutdownSignal::new(),
    )
    .spawn();
    let second = ConsumptionLoop::new(
        gateway.clone(),
        Arc::new(MarkerClassifier::default()),
        ConsumerConfig::new("OtherQueue").with_wait_time(1),
        ShutdownSignal::new(),
    )
    .spawn();

    first.stop().await.unwrap();
    assert!(!second.is_stop_requested());
    assert!(!second.is_finished());
    second.stop().await.unwrap();
}
