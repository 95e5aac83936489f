//! Graceful Shutdown Handler
//!
//! One flag that flips once when the daemon starts stopping, plus a count
//! of gateway calls still in flight so shutdown can drain them.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Shared stop flag and in-flight call counter.
#[derive(Clone)]
pub struct ShutdownController {
    stopping: Arc<watch::Sender<bool>>,
    active_calls: Arc<watch::Sender<usize>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (stopping, _) = watch::channel(false);
        let (active_calls, _) = watch::channel(0);
        Self {
            stopping: Arc::new(stopping),
            active_calls: Arc::new(active_calls),
        }
    }

    /// Flip the stop flag. Only the first call logs.
    pub fn shutdown(&self) {
        let flipped = self.stopping.send_if_modified(|stopping| !std::mem::replace(stopping, true));
        if flipped {
            tracing::info!("stopping, {} calls in flight", self.active_calls());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once `shutdown` has been called, immediately if it already was.
    pub async fn stopped(&self) {
        let mut rx = self.stopping.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await.is_ok();
    }

    pub fn active_calls(&self) -> usize {
        *self.active_calls.borrow()
    }

    /// Count one call as in flight until the guard is dropped.
    pub fn call_guard(&self) -> CallGuard {
        self.active_calls.send_modify(|n| *n += 1);
        CallGuard {
            active_calls: self.active_calls.clone(),
        }
    }

    /// Wait for the in-flight count to reach zero. False if `timeout` ran out first.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut calls = self.active_calls.subscribe();
        let drained = tokio::time::timeout(timeout, calls.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if !drained {
            tracing::warn!("gave up draining with {} calls in flight", self.active_calls());
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the gateway for the duration of one call.
pub struct CallGuard {
    active_calls: Arc<watch::Sender<usize>>,
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.active_calls.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Wait for SIGINT or SIGTERM and stop `controller`.
pub async fn shutdown_signal(controller: ShutdownController) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let name = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    tracing::info!("received {}", name);

    controller.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shutdown_is_sticky() {
        let controller = ShutdownController::new();
        assert!(!controller.is_shutdown());

        controller.shutdown();
        controller.shutdown();
        assert!(controller.is_shutdown());
        assert!(controller.clone().is_shutdown());
    }

    #[test]
    fn test_guards_count_calls() {
        let controller = ShutdownController::new();

        let first = controller.call_guard();
        let second = controller.clone().call_guard();
        assert_eq!(controller.active_calls(), 2);

        drop(first);
        assert_eq!(controller.active_calls(), 1);
        drop(second);
        assert_eq!(controller.active_calls(), 0);
    }

    #[tokio::test]
    async fn test_stopped_after_shutdown() {
        let controller = ShutdownController::new();
        let waiter = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.stopped().await })
        };

        controller.shutdown();
        tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .unwrap()
            .unwrap();

        // Late waiters resolve immediately
        tokio::time::timeout(Duration::from_millis(10), controller.stopped())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_last_call() {
        let controller = ShutdownController::new();
        assert!(controller.wait_for_drain(Duration::from_millis(10)).await);

        let guard = controller.call_guard();
        controller.shutdown();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        assert!(controller.wait_for_drain(Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_drain_gives_up() {
        let controller = ShutdownController::new();
        let _guard = controller.call_guard();

        assert!(!controller.wait_for_drain(Duration::from_millis(20)).await);
        assert_eq!(controller.active_calls(), 1);
    }
}
