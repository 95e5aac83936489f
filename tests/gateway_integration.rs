//! Integration tests for the gateway
//!
//! Drives calls end to end through the public API: static topology,
//! health registry, connection pool, stream logger and counters.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tablet_gateway::adapters::outbound::{DashMapGatewayMetrics, StaticTopology, StreamLogger};
use tablet_gateway::domain::entities::ProbeReport;
use tablet_gateway::domain::errors::{ProbeError, TopologyError};
use tablet_gateway::infrastructure::admission::AdmissionMode;
use tablet_gateway::infrastructure::connection_pool::{ConnectionPool, PoolConfig};
use tablet_gateway::infrastructure::health_registry::{HealthRegistry, HealthRegistryConfig};
use tablet_gateway::infrastructure::topology_cache::ResilientTopologyCache;
use tablet_gateway::{
    CallerIdentity, Endpoint, Gateway, GatewayError, GatewayMetrics, GatewaySettings, HealthProbe,
    QueryAttemptRecord, QueryError, QueryExecutor, QueryRequest, QueryResponse, TabletConnection,
    TabletRole, Target, TopologyService,
};

const TOPOLOGY: &str = "test_nj/commerce/0/primary/100@10.0.0.1:15991;\
                        test_nj/commerce/0/replica/101@10.0.0.2:15991;\
                        test_nj/commerce/0/replica/102@10.0.0.3:15991";

// ===== Test doubles =====

struct NoProbe;

#[async_trait]
impl HealthProbe for NoProbe {
    async fn probe(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<ProbeReport, ProbeError> {
        Err(ProbeError::Failed("probing disabled".into()))
    }
}

/// Topology service that can be switched off or rewritten.
struct FlakyTopology {
    inner: RwLock<Arc<StaticTopology>>,
    down: AtomicBool,
}

impl FlakyTopology {
    fn rewrite(&self, entries: &str) {
        *self.inner.write() = Arc::new(StaticTopology::parse(entries).unwrap());
    }
}

#[async_trait]
impl TopologyService for FlakyTopology {
    async fn fetch(&self, cell: &str, keyspace: &str) -> Result<Vec<Endpoint>, TopologyError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TopologyError::Unavailable("topo server down".into()));
        }
        let inner = self.inner.read().clone();
        inner.fetch(cell, keyspace).await
    }
}

/// Executor answering every query, refusing connections to listed tablets.
#[derive(Default)]
struct FakeExecutor {
    refused: Mutex<Vec<u32>>,
    connects: AtomicU32,
    dialed: Mutex<Vec<String>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    latency: Duration,
}

#[async_trait]
impl QueryExecutor for FakeExecutor {
    async fn connect(&self, endpoint: &Endpoint, _timeout: Duration) -> Result<Box<dyn TabletConnection>, QueryError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.dialed.lock().push(endpoint.addr());
        if self.refused.lock().contains(&endpoint.uid) {
            return Err(QueryError::ConnectionRefused(endpoint.addr()));
        }
        Ok(Box::new(FakeConnection {
            running: self.running.clone(),
            peak: self.peak.clone(),
            latency: self.latency,
        }))
    }
}

struct FakeConnection {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    latency: Duration,
}

#[async_trait]
impl TabletConnection for FakeConnection {
    async fn execute(
        &mut self,
        request: &QueryRequest,
        _timeout: Duration,
        record: &mut QueryAttemptRecord,
    ) -> Result<QueryResponse, QueryError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let started = std::time::Instant::now();
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        record.record_backend_round_trip(request.sql.clone(), started);

        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok(QueryResponse {
            rows_affected: 1,
            rows: vec![vec![1i64.into(), "bob".into()]],
        })
    }
}

// ===== Harness =====

struct Stack {
    gateway: Arc<Gateway>,
    registry: HealthRegistry,
    topology: Arc<FlakyTopology>,
    executor: Arc<FakeExecutor>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<DashMapGatewayMetrics>,
    query_log: StreamLogger,
}

fn build(settings: GatewaySettings, pool: PoolConfig, executor: FakeExecutor) -> Stack {
    let metrics = Arc::new(DashMapGatewayMetrics::new());
    let topology = Arc::new(FlakyTopology {
        inner: RwLock::new(Arc::new(StaticTopology::parse(TOPOLOGY).unwrap())),
        down: AtomicBool::new(false),
    });
    let cache = Arc::new(
        ResilientTopologyCache::new(topology.clone(), Duration::from_millis(200)).with_metrics(metrics.clone()),
    );
    let registry = HealthRegistry::new(
        HealthRegistryConfig {
            unhealthy_threshold: 2,
            ..Default::default()
        },
        Arc::new(NoProbe),
    )
    .with_metrics(metrics.clone());
    let pool = Arc::new(ConnectionPool::new(pool).with_metrics(metrics.clone()));
    let query_log = StreamLogger::new("querylog", 64);
    let executor = Arc::new(executor);

    let gateway = Gateway::new(
        settings,
        cache,
        registry.clone(),
        pool.clone(),
        executor.clone(),
        Arc::new(query_log.clone()),
        metrics.clone(),
    );

    Stack {
        gateway: Arc::new(gateway),
        registry,
        topology,
        executor,
        pool,
        metrics,
        query_log,
    }
}

fn alias(uid: u32) -> tablet_gateway::TabletAlias {
    tablet_gateway::TabletAlias {
        cell: "test_nj".to_string(),
        uid,
    }
}

/// Resolve once so the registry knows the tablets, then mark `uids` serving.
async fn mark_serving(stack: &Stack, uids: &[u32]) {
    let primary = Target::new("commerce", "0", TabletRole::Primary);
    let _ = stack
        .gateway
        .execute(&primary, &QueryRequest::new("Warmup", "select 1"), CallerIdentity::default())
        .await;
    for uid in uids {
        stack.registry.record_probe(&alias(*uid), Ok(ProbeReport::serving(Duration::ZERO)));
    }
}

fn replica() -> Target {
    Target::new("commerce", "0", TabletRole::Replica)
}

fn settings() -> GatewaySettings {
    GatewaySettings {
        retry_delay: Duration::from_millis(2),
        ..Default::default()
    }
}

// ===== Scenarios =====

#[tokio::test]
async fn test_call_is_logged_with_redacted_binds() {
    let stack = build(settings(), PoolConfig::default(), FakeExecutor::default());
    mark_serving(&stack, &[101, 102]).await;
    let mut log = stack.query_log.subscribe();

    let request = QueryRequest::new("Execute", "select * from user where name = :name")
        .bind("name", "hello")
        .bind("id", 42i64);
    let caller = CallerIdentity::new("app", "alice").with_call_info("10.1.1.1:5000", "alice");

    let response = stack.gateway.execute(&replica(), &request, caller).await.unwrap();
    assert_eq!(response.rows_affected, 1);

    let record = log.recv().await.unwrap();
    assert_eq!(record.attempts, 1);
    assert_eq!(record.fmt_bind_variables(false), r#"{"id":42,"name":"string 5"}"#);
    assert_eq!(record.fmt_query_sources(), "backend");

    let line = record.format(false);
    assert!(line.starts_with("Execute\t10.1.1.1:5000\talice\t'app'\t'alice'\t"));
    assert!(line.ends_with("\t\n"));
}

#[tokio::test]
async fn test_stale_topology_keeps_routing() {
    let stack = build(settings(), PoolConfig::default(), FakeExecutor::default());
    mark_serving(&stack, &[101]).await;

    stack.topology.down.store(true, Ordering::SeqCst);

    let result = stack
        .gateway
        .execute(&replica(), &QueryRequest::new("Execute", "select 1"), CallerIdentity::default())
        .await;
    assert!(result.is_ok());
    assert_eq!(stack.metrics.snapshot().topology_fetch_failures["commerce"], 1);
}

#[tokio::test]
async fn test_unhealthy_tablet_not_routed() {
    let stack = build(settings(), PoolConfig::default(), FakeExecutor::default());
    mark_serving(&stack, &[101, 102]).await;

    for _ in 0..2 {
        stack
            .registry
            .record_probe(&alias(101), Err(ProbeError::Failed("connection refused".into())));
    }

    for _ in 0..5 {
        stack
            .gateway
            .execute(&replica(), &QueryRequest::new("Execute", "select 1"), CallerIdentity::default())
            .await
            .unwrap();
    }
    assert_eq!(stack.metrics.attempt_count(&alias(101)), 0);
    assert_eq!(stack.metrics.attempt_count(&alias(102)), 5);
}

#[tokio::test]
async fn test_refused_tablet_retried_elsewhere() {
    let executor = FakeExecutor::default();
    executor.refused.lock().push(101);
    let stack = build(settings(), PoolConfig::default(), executor);
    mark_serving(&stack, &[101, 102]).await;
    let mut log = stack.query_log.subscribe();

    for _ in 0..3 {
        stack
            .gateway
            .execute(&replica(), &QueryRequest::new("Execute", "select 1"), CallerIdentity::default())
            .await
            .unwrap();
    }

    let mut attempts = 0;
    for _ in 0..3 {
        attempts += log.recv().await.unwrap().attempts;
    }
    assert!(attempts <= 3 * 3);
    assert!(stack.metrics.attempt_count(&alias(102)) >= 3);
}

#[tokio::test]
async fn test_no_serving_replica() {
    let stack = build(settings(), PoolConfig::default(), FakeExecutor::default());
    mark_serving(&stack, &[100]).await;
    let connects_before = stack.executor.connects.load(Ordering::SeqCst);

    let err = stack
        .gateway
        .execute(&replica(), &QueryRequest::new("Execute", "select 1"), CallerIdentity::default())
        .await
        .unwrap_err();

    assert_eq!(err, GatewayError::NoHealthyEndpoint { target: replica() });
    assert_eq!(stack.executor.connects.load(Ordering::SeqCst), connects_before);
}

#[tokio::test]
async fn test_admission_bounds_concurrency() {
    let stack = build(
        GatewaySettings {
            max_in_flight: 2,
            admission_mode: AdmissionMode::Block,
            ..settings()
        },
        PoolConfig::default(),
        FakeExecutor {
            latency: Duration::from_millis(20),
            ..Default::default()
        },
    );
    mark_serving(&stack, &[101, 102]).await;

    let mut calls = Vec::new();
    for _ in 0..10 {
        let gateway = stack.gateway.clone();
        calls.push(tokio::spawn(async move {
            gateway
                .execute(&replica(), &QueryRequest::new("Execute", "select 1"), CallerIdentity::default())
                .await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    assert!(stack.executor.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(stack.gateway.admission().in_flight(), 0);
}

#[tokio::test]
async fn test_connections_recycled_after_lifetime() {
    let stack = build(
        settings(),
        PoolConfig {
            conn_life: Duration::from_millis(20),
            ..Default::default()
        },
        FakeExecutor::default(),
    );
    mark_serving(&stack, &[101]).await;
    let connects_before = stack.executor.connects.load(Ordering::SeqCst);

    let request = QueryRequest::new("Execute", "select 1");
    stack
        .gateway
        .execute(&replica(), &request, CallerIdentity::default())
        .await
        .unwrap();
    stack
        .gateway
        .execute(&replica(), &request, CallerIdentity::default())
        .await
        .unwrap();
    assert_eq!(stack.executor.connects.load(Ordering::SeqCst), connects_before + 1);

    tokio::time::sleep(Duration::from_millis(50)).await;
    stack
        .gateway
        .execute(&replica(), &request, CallerIdentity::default())
        .await
        .unwrap();
    assert_eq!(stack.executor.connects.load(Ordering::SeqCst), connects_before + 2);
    assert_eq!(stack.metrics.connection_count(&alias(101)), 1);
}

#[tokio::test]
async fn test_reparent_moves_traffic_to_promoted_tablet() {
    let stack = build(settings(), PoolConfig::default(), FakeExecutor::default());
    mark_serving(&stack, &[100, 101, 102]).await;
    let primary = Target::new("commerce", "0", TabletRole::Primary);
    let request = QueryRequest::new("Execute", "select 1");

    stack
        .gateway
        .execute(&primary, &request, CallerIdentity::default())
        .await
        .unwrap();
    assert!(stack.pool.stats(&alias(100)).await.is_some());

    // 101 is promoted and restarted elsewhere; the old primary is gone
    stack.topology.rewrite(
        "test_nj/commerce/0/primary/101@10.0.0.9:15991;\
         test_nj/commerce/0/replica/102@10.0.0.3:15991",
    );

    let err = stack
        .gateway
        .execute(&primary, &request, CallerIdentity::default())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::NoHealthyEndpoint { target: primary.clone() });
    assert!(stack.pool.stats(&alias(100)).await.is_none());

    stack.registry.record_probe(&alias(101), Ok(ProbeReport::serving(Duration::ZERO)));
    stack
        .gateway
        .execute(&primary, &request, CallerIdentity::default())
        .await
        .unwrap();

    assert_eq!(stack.executor.dialed.lock().last().map(String::as_str), Some("10.0.0.9:15991"));
    let replicas = stack.registry.snapshot(&replica()).unwrap();
    assert_eq!(replicas.len(), 1);
    assert!(replicas.contains(&alias(102)));
}
