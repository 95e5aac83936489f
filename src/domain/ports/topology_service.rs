//! Topology Service Port
//!
//! Defines the interface for reading which tablets serve a keyspace.
//! Implementations may read a consensus store, a static map, or a remote API.

use crate::domain::entities::Endpoint;
use crate::domain::errors::TopologyError;
use async_trait::async_trait;

/// Source of truth for tablet placement.
///
/// This is an outbound port. The gateway never calls it directly; all
/// reads go through the resilient topology cache, which bounds each fetch
/// by a timeout and falls back to cached data on failure.
#[async_trait]
pub trait TopologyService: Send + Sync {
    /// Fetch every tablet of `keyspace` in `cell`.
    async fn fetch(&self, cell: &str, keyspace: &str) -> Result<Vec<Endpoint>, TopologyError>;
}
