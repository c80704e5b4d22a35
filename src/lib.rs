//! Fanout worker - SNS/SQS message processing.
//!
//! Publishes messages to a fan-out topic and runs a single consumption loop
//! over a subscribed queue: poll, classify, delete on success, leave failures
//! for redelivery until the queue's redrive policy dead-letters them.

pub mod classifier;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod gateway;
pub mod publisher;
pub mod shutdown;
pub mod utils;

pub use classifier::{Classifier, MarkerClassifier, Outcome};
pub use consumer::{ConsumerConfig, ConsumerHandle, ConsumerReport, ConsumptionLoop, LoopState};
pub use gateway::{GatewayError, Message, QueueGateway};
pub use publisher::Publisher;
pub use shutdown::ShutdownSignal;
