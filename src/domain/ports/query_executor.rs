//! Query Executor Port
//!
//! Defines the interface to the engine that actually runs queries on a
//! tablet once the gateway has picked one.

use crate::domain::entities::{Endpoint, QueryRequest, QueryResponse};
use crate::domain::errors::QueryError;
use crate::domain::query_record::QueryAttemptRecord;
use async_trait::async_trait;
use std::time::Duration;

/// Opens connections to tablets.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Open a new connection to `endpoint` within `timeout`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn TabletConnection>, QueryError>;
}

/// An open connection to one tablet.
///
/// Owned by exactly one attempt at a time; the connection pool hands it
/// out and takes it back.
#[async_trait]
pub trait TabletConnection: Send {
    /// Run `request` within `timeout`.
    ///
    /// Every statement sent to the tablet is recorded on `record` through
    /// [`QueryAttemptRecord::record_backend_round_trip`]. Errors must be
    /// classified: transport failures are retryable, query failures fatal.
    async fn execute(
        &mut self,
        request: &QueryRequest,
        timeout: Duration,
        record: &mut QueryAttemptRecord,
    ) -> Result<QueryResponse, QueryError>;

    /// Close the connection. Called when the pool discards it.
    async fn close(&mut self) {}
}
