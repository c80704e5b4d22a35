//! Per-message processing decision.
//!
//! A classifier is a pure function of the message body (plus whatever state
//! it was built with). It decides whether a message was processed
//! successfully and therefore may be acknowledged.

use crate::gateway::Message;

/// Default marker that makes `MarkerClassifier` reject a message.
pub const DEFAULT_FAILURE_MARKER: &str = "error";

/// Business-level rejection of a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Classification failed: {reason}")]
pub struct ClassificationFailure {
    pub reason: String,
}

impl ClassificationFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Processing outcome for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; the message may be deleted.
    Success,
    /// Rejected; the message stays on the queue for redelivery.
    Failure(ClassificationFailure),
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Outcome::Failure(ClassificationFailure::new(reason))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// Decides the outcome of processing a single message.
pub trait Classifier: Send + Sync {
    fn classify(&self, message: &Message) -> Outcome;
}

impl<F> Classifier for F
where
    F: Fn(&Message) -> Outcome + Send + Sync,
{
    fn classify(&self, message: &Message) -> Outcome {
        self(message)
    }
}

/// Rejects any message whose body contains a marker substring.
///
/// Matching is case-sensitive.
#[derive(Debug, Clone)]
pub struct MarkerClassifier {
    marker: String,
}

impl MarkerClassifier {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Default for MarkerClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_MARKER)
    }
}

impl Classifier for MarkerClassifier {
    fn classify(&self, message: &Message) -> Outcome {
        if message.body.contains(&self.marker) {
            Outcome::failure(format!("body contains failure marker '{}'", self.marker))
        } else {
            Outcome::Success
        }
    }
}
