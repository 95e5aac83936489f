//! Gateway - Main application use case
//!
//! Routes one call to a healthy tablet of its target, retrying transient
//! failures on other tablets within the call's deadline, and hands a
//! finished attempt record to the telemetry sink.

use crate::application::call_options::{CallOptions, CancelSignal};
use crate::domain::entities::{CallerIdentity, Endpoint, QueryRequest, QueryResponse, TabletAlias};
use crate::domain::errors::{GatewayError, QueryError};
use crate::domain::ports::{GatewayMetrics, QueryExecutor, TelemetrySink};
use crate::domain::query_record::QueryAttemptRecord;
use crate::domain::services::EndpointSelector;
use crate::domain::value_objects::Target;
use crate::infrastructure::admission::{AdmissionController, AdmissionMode};
use crate::infrastructure::connection_pool::ConnectionPool;
use crate::infrastructure::health_registry::{HealthRegistry, TopologyChanges};
use crate::infrastructure::shutdown::ShutdownController;
use crate::infrastructure::topology_cache::ResilientTopologyCache;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Routing and retry settings of a gateway.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Cell the gateway resolves topology in
    pub cell: String,
    /// Pause between a failed attempt and the next one
    pub retry_delay: Duration,
    /// Retries allowed after the first attempt
    pub retry_count: u32,
    /// Bound on a whole call
    pub timeout_total: Duration,
    /// Bound on a single attempt
    pub timeout_per_conn: Duration,
    /// Calls allowed in flight at once (0 = unbounded)
    pub max_in_flight: usize,
    pub admission_mode: AdmissionMode,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            cell: "test_nj".to_string(),
            retry_delay: Duration::from_millis(2),
            retry_count: 2,
            timeout_total: Duration::from_secs(3),
            timeout_per_conn: Duration::from_millis(1500),
            max_in_flight: 0,
            admission_mode: AdmissionMode::Block,
        }
    }
}

/// Gateway - main application use case.
///
/// 1. Admits the call under the in-flight limit
/// 2. Resolves the target's tablets and their health
/// 3. Runs attempts, retrying transient failures
/// 4. Finalizes and emits the attempt record
pub struct Gateway {
    settings: GatewaySettings,
    admission: AdmissionController,
    topology: Arc<ResilientTopologyCache>,
    registry: HealthRegistry,
    pool: Arc<ConnectionPool>,
    executor: Arc<dyn QueryExecutor>,
    sink: Arc<dyn TelemetrySink>,
    metrics: Arc<dyn GatewayMetrics>,
    /// When each tablet was last handed an attempt
    last_used: DashMap<TabletAlias, Instant>,
    shutdown: Option<ShutdownController>,
}

impl Gateway {
    pub fn new(
        settings: GatewaySettings,
        topology: Arc<ResilientTopologyCache>,
        registry: HealthRegistry,
        pool: Arc<ConnectionPool>,
        executor: Arc<dyn QueryExecutor>,
        sink: Arc<dyn TelemetrySink>,
        metrics: Arc<dyn GatewayMetrics>,
    ) -> Self {
        let admission = AdmissionController::new(settings.max_in_flight, settings.admission_mode);
        Self {
            settings,
            admission,
            topology,
            registry,
            pool,
            executor,
            sink,
            metrics,
            last_used: DashMap::new(),
            shutdown: None,
        }
    }

    /// Track in-flight calls on `controller` so shutdown can drain them.
    pub fn with_shutdown(mut self, controller: ShutdownController) -> Self {
        self.shutdown = Some(controller);
        self
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Run `request` against `target` with default options.
    pub async fn execute(
        &self,
        target: &Target,
        request: &QueryRequest,
        caller: CallerIdentity,
    ) -> Result<QueryResponse, GatewayError> {
        self.execute_with(target, request, caller, CallOptions::default()).await
    }

    /// Run `request` against `target`.
    ///
    /// Exactly one attempt record is emitted per call, whatever the outcome.
    pub async fn execute_with(
        &self,
        target: &Target,
        request: &QueryRequest,
        caller: CallerIdentity,
        options: CallOptions,
    ) -> Result<QueryResponse, GatewayError> {
        let _call = self.shutdown.as_ref().map(ShutdownController::call_guard);

        let mut record = QueryAttemptRecord::new(caller, request);
        let deadline = options.effective_deadline(Instant::now() + self.settings.timeout_total);

        let result = self
            .run(target, request, &mut record, deadline, options.cancel)
            .await;

        record.finish(result.as_ref().err().cloned());
        self.sink.send(record);
        result
    }

    async fn run(
        &self,
        target: &Target,
        request: &QueryRequest,
        record: &mut QueryAttemptRecord,
        deadline: Instant,
        mut cancel: Option<CancelSignal>,
    ) -> Result<QueryResponse, GatewayError> {
        // Admission
        let waiting = Instant::now();
        let admitted = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(GatewayError::deadline("waiting for admission")),
            permit = self.admission.acquire(deadline) => permit,
        };
        record.waiting_for_admission = waiting.elapsed();
        let _permit = admitted.map_err(|e| {
            if matches!(e, GatewayError::Overloaded { .. }) {
                self.metrics.record_admission_rejected();
            }
            e
        })?;

        // Resolution
        let resolved = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => return Err(GatewayError::deadline("resolving topology")),
            resolved = tokio::time::timeout_at(
                tokio::time::Instant::from_std(deadline),
                self.topology.resolve(&self.settings.cell, &target.keyspace),
            ) => resolved,
        };
        let snapshot = resolved.map_err(|_| GatewayError::deadline("resolving topology"))??;
        let changes = self.registry.sync_topology(&snapshot);
        if !changes.is_empty() {
            self.forget_tablets(&changes).await;
        }

        let no_healthy = || GatewayError::NoHealthyEndpoint { target: target.clone() };
        let set = self
            .registry
            .snapshot(target)
            .filter(|set| !set.is_empty())
            .ok_or_else(no_healthy)?;

        // Attempts
        let mut tried: Vec<TabletAlias> = Vec::new();
        let mut failed_attempts: u32 = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::deadline("executing query"));
            }

            let endpoint = EndpointSelector::pick(&set, &tried, |alias| {
                self.last_used.get(alias).map(|used| *used.value())
            })
            .map(|health| health.endpoint.clone())
            .ok_or_else(no_healthy)?;
            let alias = endpoint.alias();
            tracing::debug!("attempt {} for {} on {}", failed_attempts + 1, target, alias);

            self.last_used.insert(alias.clone(), Instant::now());
            if !tried.contains(&alias) {
                tried.push(alias.clone());
            }
            record.record_attempt(alias.clone());
            self.metrics.record_attempt(&alias);

            let attempt_timeout = self.settings.timeout_per_conn.min(remaining);
            let error = match self.attempt(&endpoint, request, attempt_timeout, record).await {
                Ok(response) => {
                    record.record_response(&response);
                    return Ok(response);
                }
                Err(error) => error,
            };
            self.metrics.record_attempt_failure(&alias);

            if !error.is_retryable() {
                return Err(GatewayError::Fatal(error));
            }

            failed_attempts += 1;
            tracing::warn!(
                "attempt {} for {} on {} failed: {}",
                failed_attempts,
                target,
                alias,
                error
            );
            if failed_attempts > self.settings.retry_count {
                return Err(GatewayError::RetriesExhausted {
                    attempts: failed_attempts,
                    last_error: error,
                });
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::deadline("retrying"));
            }

            let wake = (Instant::now() + self.settings.retry_delay).min(deadline);
            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => return Err(GatewayError::deadline("waiting to retry")),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }
        }
    }

    /// Drop per-tablet state for tablets that moved or left the topology.
    async fn forget_tablets(&self, changes: &TopologyChanges) {
        for alias in changes.updated.iter().chain(&changes.removed) {
            self.pool.remove_tablet(alias).await;
        }
        for alias in &changes.removed {
            self.last_used.remove(alias);
        }
    }

    /// One attempt on one tablet, bounded by `timeout` end to end.
    async fn attempt(
        &self,
        endpoint: &Endpoint,
        request: &QueryRequest,
        timeout: Duration,
        record: &mut QueryAttemptRecord,
    ) -> Result<QueryResponse, QueryError> {
        let started = Instant::now();
        let mut conn = self
            .pool
            .checkout(endpoint, self.executor.as_ref(), timeout)
            .await?;
        record.waiting_for_connection += started.elapsed();

        let remaining = timeout.saturating_sub(started.elapsed());
        let result = match tokio::time::timeout(remaining, conn.conn.execute(request, remaining, record)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(timeout)),
        };

        match &result {
            Err(error) if error.is_transport() => self.pool.discard(conn).await,
            _ => self.pool.checkin(conn).await,
        }
        result
    }
}

/// Resolves when `cancel` fires; pending forever without a signal.
async fn cancelled(cancel: &mut Option<CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}
