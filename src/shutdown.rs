//! Cooperative cancellation shared by the worker loops.

use std::time::Duration;
use tokio::sync::watch;

/// Receiving side of the process-wide shutdown flag.
///
/// A dropped trigger counts as a shutdown request, so loops never outlive
/// their owner.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending side, held by the orchestrator.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been requested.
    pub async fn requested(&mut self) {
        // Err means the trigger is gone.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }

    /// Sleep for `duration`. Returns `false` if interrupted by shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.requested() => false,
            _ = tokio::time::sleep(duration) => !self.is_requested(),
        }
    }
}
