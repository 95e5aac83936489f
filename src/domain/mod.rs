//! Domain Layer
//!
//! Entities, value objects, ports and pure routing logic. Nothing in here
//! performs I/O.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod query_record;
pub mod services;
pub mod value_objects;

pub use entities::{
    CallerIdentity, Endpoint, EndpointHealth, HealthSet, ProbeReport, QueryRequest, QueryResponse,
    Row, SharedHealthSet, TabletAlias, TopologySnapshot,
};
pub use errors::{ErrorClass, GatewayError, ProbeError, QueryError, TopologyError};
pub use query_record::QueryAttemptRecord;
pub use value_objects::{BindValue, QuerySource, QuerySources, TabletRole, Target};
