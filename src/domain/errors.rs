//! Domain Errors
//!
//! Errors returned to gateway callers, plus the internal failures of the
//! ports that the gateway absorbs.

use crate::domain::value_objects::Target;
use std::time::Duration;
use thiserror::Error;

/// Whether a failed attempt may be retried on another (or the same) tablet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport-level failure; the query never reached a verdict
    Retryable,
    /// Application or query-level failure; retrying cannot help
    Fatal,
}

/// Classified failure reported by the query executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("tablet no longer serving: {0}")]
    EndpointUnhealthy(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("{message} (errno {code})")]
    Application { code: u32, message: String },
}

impl QueryError {
    pub fn application(code: u32, message: impl Into<String>) -> Self {
        Self::Application {
            code,
            message: message.into(),
        }
    }

    pub fn classification(&self) -> ErrorClass {
        match self {
            Self::Application { .. } => ErrorClass::Fatal,
            _ => ErrorClass::Retryable,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == ErrorClass::Retryable
    }

    /// Whether the connection that produced this error must be discarded.
    pub fn is_transport(&self) -> bool {
        self.is_retryable()
    }
}

/// Errors returned by [`crate::application::Gateway::execute`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("too many in-flight calls (limit {limit})")]
    Overloaded { limit: usize },

    #[error("deadline exceeded while {stage}")]
    DeadlineExceeded { stage: &'static str },

    #[error("no healthy endpoint for {target}")]
    NoHealthyEndpoint { target: Target },

    #[error("cannot resolve keyspace {keyspace} in cell {cell}: {reason}")]
    TargetUnresolved {
        cell: String,
        keyspace: String,
        reason: String,
    },

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: QueryError },

    #[error(transparent)]
    Fatal(QueryError),
}

impl GatewayError {
    pub fn deadline(stage: &'static str) -> Self {
        Self::DeadlineExceeded { stage }
    }
}

/// Failure fetching from the topology service. Absorbed by the cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("keyspace {0} not found")]
    NoNode(String),

    #[error("topology fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("topology service unavailable: {0}")]
    Unavailable(String),
}

/// Failure of a health probe. Absorbed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe failed: {0}")]
    Failed(String),
}
