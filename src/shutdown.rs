//! Cooperative shutdown signal for the consumption loop.
//!
//! The controller owns a `ShutdownSignal` and hands a clone to the loop at
//! construction. The loop reads it at its checkpoints and waits on it while
//! backing off; nothing else is interrupted in flight.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Write-once stop flag shared between a controller and a consumption loop.
///
/// Clones observe the same flag. Independent loops get independent signals.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    requested: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (requested, _) = watch::channel(false);
        Self {
            requested: Arc::new(requested),
        }
    }

    /// Request a stop.
    ///
    /// Idempotent: returns `true` only for the call that set the flag.
    pub fn signal_stop(&self) -> bool {
        let first = self.requested.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        });
        if first {
            info!("Shutting down message processor");
        }
        first
    }

    /// Non-blocking read of the flag.
    pub fn is_stop_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.requested.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}
