//! tablet-gateway Library
//!
//! Resilient routing of queries to sharded tablets: health tracking,
//! topology caching, connection pooling, admission control, retries and
//! per-call attempt records.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{CallOptions, Gateway, GatewaySettings};
pub use config::{load_config, ConfigError, GatewayConfig};
pub use domain::entities::{CallerIdentity, Endpoint, QueryRequest, QueryResponse, TabletAlias};
pub use domain::errors::{GatewayError, QueryError};
pub use domain::ports::{GatewayMetrics, HealthProbe, QueryExecutor, TabletConnection, TelemetrySink, TopologyService};
pub use domain::query_record::QueryAttemptRecord;
pub use domain::value_objects::{BindValue, TabletRole, Target};
