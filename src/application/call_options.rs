//! Per-call options: caller deadline and cancellation.

use std::time::Instant;
use tokio::sync::watch;

/// Options for a single gateway call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Caller-imposed deadline. The gateway uses the earlier of this and
    /// its own total timeout.
    pub deadline: Option<Instant>,
    /// Aborts the call at its next suspension point.
    pub cancel: Option<CancelSignal>,
}

impl CallOptions {
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Earlier of the caller deadline and `gateway_deadline`.
    pub fn effective_deadline(&self, gateway_deadline: Instant) -> Instant {
        match self.deadline {
            Some(deadline) => deadline.min(gateway_deadline),
            None => gateway_deadline,
        }
    }
}

/// Create a linked cancellation handle and signal.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle(tx), CancelSignal(rx))
}

/// Caller side: fires the cancellation.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Gateway side: observes the cancellation.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle is dropped
    /// without cancelling.
    pub async fn cancelled(&mut self) {
        let fired = self.0.wait_for(|cancelled| *cancelled).await.is_ok();
        if !fired {
            std::future::pending::<()>().await;
        }
    }
}
