mod dashmap_gateway_metrics;
mod http_health_probe;
mod static_topology;
mod stream_logger;
mod tcp_health_probe;

pub use dashmap_gateway_metrics::{DashMapGatewayMetrics, MetricsSnapshot, TabletCounters};
pub use http_health_probe::HttpHealthProbe;
pub use static_topology::StaticTopology;
pub use stream_logger::StreamLogger;
pub use tcp_health_probe::TcpHealthProbe;
