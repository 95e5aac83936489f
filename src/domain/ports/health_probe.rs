//! Health Probe Port
//!
//! Defines the interface for asking a tablet whether it is serving.

use crate::domain::entities::{Endpoint, ProbeReport};
use crate::domain::errors::ProbeError;
use async_trait::async_trait;
use std::time::Duration;

/// One request/response exchange with a tablet's health endpoint.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe `endpoint`, giving up after `timeout`.
    ///
    /// Implementations must return [`ProbeError::Timeout`] when the bound
    /// is hit so the registry can count it.
    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<ProbeReport, ProbeError>;
}
