//! Admission Control
//!
//! Bounds the number of calls in flight through the gateway.

use crate::domain::errors::GatewayError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// What to do when every admission slot is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdmissionMode {
    /// Wait for a slot until the call's deadline
    #[default]
    Block,
    /// Fail with `Overloaded` right away
    Reject,
}

/// Admission controller.
///
/// A `max_in_flight` of 0 means unbounded: acquisition never waits.
pub struct AdmissionController {
    limit: usize,
    mode: AdmissionMode,
    semaphore: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
}

impl AdmissionController {
    pub fn new(max_in_flight: usize, mode: AdmissionMode) -> Self {
        let semaphore = if max_in_flight == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(max_in_flight)))
        };
        Self {
            limit: max_in_flight,
            mode,
            semaphore,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Acquire a slot, waiting no later than `deadline`.
    pub async fn acquire(&self, deadline: Instant) -> Result<AdmissionPermit, GatewayError> {
        let permit = match &self.semaphore {
            None => None,
            Some(semaphore) => Some(self.acquire_bounded(semaphore, deadline).await?),
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(AdmissionPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    async fn acquire_bounded(
        &self,
        semaphore: &Arc<Semaphore>,
        deadline: Instant,
    ) -> Result<OwnedSemaphorePermit, GatewayError> {
        if let Ok(permit) = semaphore.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if self.mode == AdmissionMode::Reject {
            return Err(GatewayError::Overloaded { limit: self.limit });
        }

        let deadline = tokio::time::Instant::from_std(deadline);
        match tokio::time::timeout_at(deadline, semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            // The semaphore is never closed; treat it like saturation.
            Ok(Err(_)) => Err(GatewayError::Overloaded { limit: self.limit }),
            Err(_) => Err(GatewayError::deadline("waiting for admission")),
        }
    }

    /// Configured limit (0 = unbounded).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Calls currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// RAII admission slot. Released on drop.
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
