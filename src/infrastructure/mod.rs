//! Infrastructure Layer
//!
//! Cross-cutting concerns and infrastructure components.

pub mod admission;
pub mod connection_pool;
pub mod health_registry;
pub mod shutdown;
pub mod topology_cache;

pub use admission::{AdmissionController, AdmissionMode, AdmissionPermit};
pub use connection_pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use health_registry::{HealthRegistry, HealthRegistryConfig};
pub use shutdown::{shutdown_signal, CallGuard, ShutdownController};
pub use topology_cache::ResilientTopologyCache;
