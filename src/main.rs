//! tablet-gateway - Query routing gateway daemon
//!
//! Composition root: tracks tablet health and topology for the configured
//! cell and serves the status surface.

use std::sync::Arc;
use std::time::Duration;
use tablet_gateway::adapters::inbound::{StatusServer, StatusState};
use tablet_gateway::adapters::outbound::{DashMapGatewayMetrics, StaticTopology, StreamLogger, TcpHealthProbe};
use tablet_gateway::config::load_config;
use tablet_gateway::infrastructure::health_registry::HealthRegistry;
use tablet_gateway::infrastructure::shutdown::{shutdown_signal, ShutdownController};
use tablet_gateway::infrastructure::topology_cache::ResilientTopologyCache;
use tracing_subscriber::fmt::format::FmtSpan;

/// How often the daemon re-resolves topology for its keyspaces.
const TOPOLOGY_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// How long in-flight work gets to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;
    cfg.validate()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting tablet-gateway cell={} status={} retry_count={} timeout={}ms",
        cfg.cell,
        cfg.status_listen_addr,
        cfg.retry_count,
        cfg.conn_timeout_total_ms
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    let metrics = Arc::new(DashMapGatewayMetrics::new());
    let topology = Arc::new(StaticTopology::parse(&cfg.static_topology)?);
    let query_log = StreamLogger::new("querylog", cfg.query_log_buffer);

    // 2. Infrastructure
    let cache = Arc::new(
        ResilientTopologyCache::new(topology.clone(), cfg.topology_fetch_timeout())
            .with_metrics(metrics.clone()),
    );
    let registry = HealthRegistry::new(cfg.health_registry_config(), Arc::new(TcpHealthProbe::new()))
        .with_metrics(metrics.clone());

    let keyspaces: Vec<String> = topology
        .keyspaces()
        .into_iter()
        .filter(|(cell, _)| *cell == cfg.cell)
        .map(|(_, keyspace)| keyspace)
        .collect();
    if keyspaces.is_empty() {
        tracing::warn!("no tablets configured for cell {}", cfg.cell);
    }

    refresh_topology(&cache, &registry, &cfg.cell, &keyspaces).await;
    registry.start();

    {
        let cache = cache.clone();
        let registry = registry.clone();
        let cell = cfg.cell.clone();
        let keyspaces = keyspaces.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TOPOLOGY_REFRESH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                refresh_topology(&cache, &registry, &cell, &keyspaces).await;
            }
        });
    }

    // 3. Inbound adapter
    let shutdown = ShutdownController::new();
    let server = StatusServer::new(
        cfg.status_listen_addr.clone(),
        StatusState {
            registry: registry.clone(),
            metrics,
            query_log,
            ready_roles: cfg.tablet_types_to_wait.clone(),
        },
    );
    let server_shutdown = shutdown.clone();
    let server_task = tokio::spawn(async move { server.run(server_shutdown).await });

    // 4. Readiness
    if !cfg.tablet_types_to_wait.is_empty() {
        match registry
            .wait_for_roles(&cfg.tablet_types_to_wait, cfg.readiness_timeout())
            .await
        {
            Ok(()) => tracing::info!("serving tablets found for {:?}", cfg.tablet_types_to_wait),
            Err(missing) => tracing::error!("timed out waiting for tablets of type {:?}", missing),
        }
    }

    shutdown_signal(shutdown.clone()).await;

    registry.shutdown();
    shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
    server_task.await??;

    tracing::info!("tablet-gateway stopped");
    Ok(())
}

async fn refresh_topology(cache: &ResilientTopologyCache, registry: &HealthRegistry, cell: &str, keyspaces: &[String]) {
    for keyspace in keyspaces {
        match cache.resolve(cell, keyspace).await {
            Ok(snapshot) => {
                let changes = registry.sync_topology(&snapshot);
                if !changes.is_empty() {
                    tracing::debug!("topology {}/{}: {:?}", cell, keyspace, changes);
                }
            }
            Err(e) => tracing::warn!("cannot resolve {}/{}: {}", cell, keyspace, e),
        }
    }
}
