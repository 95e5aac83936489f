mod gateway_metrics;
mod health_probe;
mod query_executor;
mod telemetry_sink;
mod topology_service;

pub use gateway_metrics::GatewayMetrics;
pub use health_probe::HealthProbe;
pub use query_executor::{QueryExecutor, TabletConnection};
pub use telemetry_sink::TelemetrySink;
pub use topology_service::TopologyService;
