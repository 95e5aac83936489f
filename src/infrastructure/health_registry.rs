//! Health Registry
//!
//! Probes every known tablet in the background and publishes, per target,
//! an immutable set of the tablets currently serving it.

use crate::domain::entities::{
    Endpoint, EndpointHealth, HealthSet, ProbeReport, SharedHealthSet, TabletAlias, TopologySnapshot,
};
use crate::domain::errors::ProbeError;
use crate::domain::ports::{GatewayMetrics, HealthProbe};
use crate::domain::value_objects::{TabletRole, Target};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Health registry configuration.
#[derive(Debug, Clone)]
pub struct HealthRegistryConfig {
    /// Delay between two probes of the same tablet
    pub retry_delay: Duration,
    /// Timeout for each probe
    pub probe_timeout: Duration,
    /// Number of consecutive failures before marking a tablet not serving
    pub unhealthy_threshold: u32,
}

impl Default for HealthRegistryConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_millis(2),
            probe_timeout: Duration::from_secs(60),
            unhealthy_threshold: 3,
        }
    }
}

type HealthSets = HashMap<Target, SharedHealthSet>;

/// Tablets whose tracking changed in one topology sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyChanges {
    pub added: Vec<TabletAlias>,
    /// Known tablets that now report a different role or address
    pub updated: Vec<TabletAlias>,
    pub removed: Vec<TabletAlias>,
}

impl TopologyChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

enum Upsert {
    Added,
    /// Carries the target the tablet served before
    Updated(Target),
    Unchanged,
}

struct RegistryInner {
    config: HealthRegistryConfig,
    probe: Arc<dyn HealthProbe>,
    metrics: Option<Arc<dyn GatewayMetrics>>,
    /// Mutable per-tablet state. Writers only.
    states: Mutex<HashMap<TabletAlias, EndpointHealth>>,
    /// Published sets. Readers load without locking.
    sets: ArcSwap<HealthSets>,
    /// Running probe loops
    tasks: Mutex<HashMap<TabletAlias, JoinHandle<()>>>,
    started: Mutex<bool>,
    /// Bumped on every publish
    version: watch::Sender<u64>,
}

/// Health registry.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RegistryInner>,
}

impl HealthRegistry {
    /// Create a registry. No probing happens until [`HealthRegistry::start`].
    pub fn new(config: HealthRegistryConfig, probe: Arc<dyn HealthProbe>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                probe,
                metrics: None,
                states: Mutex::new(HashMap::new()),
                sets: ArcSwap::from_pointee(HashMap::new()),
                tasks: Mutex::new(HashMap::new()),
                started: Mutex::new(false),
                version,
            }),
        }
    }

    /// Count probe timeouts in `metrics`. Must be called before cloning.
    pub fn with_metrics(mut self, metrics: Arc<dyn GatewayMetrics>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.metrics = Some(metrics);
        }
        self
    }

    pub fn config(&self) -> &HealthRegistryConfig {
        &self.inner.config
    }

    /// Current health set for `target`.
    ///
    /// `None` means the target is unknown; an empty set means it is known
    /// but has no serving tablet.
    pub fn snapshot(&self, target: &Target) -> Option<SharedHealthSet> {
        self.inner.sets.load().get(target).cloned()
    }

    /// Every published set.
    pub fn all_sets(&self) -> Vec<SharedHealthSet> {
        let sets = self.inner.sets.load();
        let mut all: Vec<SharedHealthSet> = sets.values().cloned().collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    /// State of every known tablet, serving or not.
    pub fn endpoint_states(&self) -> Vec<EndpointHealth> {
        let mut states: Vec<EndpointHealth> = self.inner.states.lock().values().cloned().collect();
        states.sort_by(|a, b| a.endpoint.alias().cmp(&b.endpoint.alias()));
        states
    }

    /// Start probing every known tablet, and every tablet added later.
    pub fn start(&self) {
        {
            let mut started = self.inner.started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        let states = self.inner.states.lock();
        tracing::info!(
            "health registry started: {} tablets, probe every {:?}",
            states.len(),
            self.inner.config.retry_delay
        );
        for state in states.values() {
            self.spawn_probe_loop(state.endpoint.clone());
        }
    }

    /// Stop every probe loop.
    pub fn shutdown(&self) {
        let _states = self.inner.states.lock();
        *self.inner.started.lock() = false;
        for (_, task) in self.inner.tasks.lock().drain() {
            task.abort();
        }
    }

    /// Start tracking a tablet, or replace a known one whose role or address
    /// changed. Returns false if the tablet was already tracked as is.
    ///
    /// A new or replaced tablet is not serving until a probe says it is.
    pub fn add_endpoint(&self, endpoint: Endpoint) -> bool {
        !matches!(self.upsert(endpoint), Upsert::Unchanged)
    }

    fn upsert(&self, endpoint: Endpoint) -> Upsert {
        let alias = endpoint.alias();
        let mut states = self.inner.states.lock();
        let change = match states.get(&alias) {
            Some(known) if known.endpoint == endpoint => return Upsert::Unchanged,
            Some(known) => {
                tracing::info!(
                    "tablet {} moved from {} at {} to {} at {}",
                    alias,
                    known.endpoint.target,
                    known.endpoint.addr(),
                    endpoint.target,
                    endpoint.addr()
                );
                Upsert::Updated(known.endpoint.target.clone())
            }
            None => {
                tracing::info!("tracking tablet {} for {}", alias, endpoint.target);
                Upsert::Added
            }
        };

        states.insert(alias, EndpointHealth::discovered(endpoint.clone()));
        if let Upsert::Updated(previous) = &change {
            if *previous != endpoint.target {
                self.inner.publish(&states, previous);
            }
        }
        self.inner.publish(&states, &endpoint.target);

        // Spawned under the states lock so a concurrent removal cannot miss it
        if *self.inner.started.lock() {
            self.spawn_probe_loop(endpoint);
        }
        change
    }

    /// Stop tracking a tablet. Returns false if it was unknown.
    pub fn remove_endpoint(&self, alias: &TabletAlias) -> bool {
        let mut states = self.inner.states.lock();
        if let Some(task) = self.inner.tasks.lock().remove(alias) {
            task.abort();
        }

        match states.remove(alias) {
            Some(removed) => {
                tracing::info!("stopped tracking tablet {}", alias);
                self.inner.publish(&states, &removed.endpoint.target);
                true
            }
            None => false,
        }
    }

    /// Reconcile tracked tablets with a topology snapshot.
    ///
    /// New tablets are added and tablets whose role or address changed are
    /// replaced. Tablets of the snapshot's cell and keyspace missing from a
    /// fresh snapshot are removed; a stale snapshot never removes anything.
    pub fn sync_topology(&self, snapshot: &TopologySnapshot) -> TopologyChanges {
        let mut changes = TopologyChanges::default();
        for endpoint in &snapshot.endpoints {
            let alias = endpoint.alias();
            match self.upsert(endpoint.clone()) {
                Upsert::Added => changes.added.push(alias),
                Upsert::Updated(_) => changes.updated.push(alias),
                Upsert::Unchanged => {}
            }
        }

        if snapshot.stale {
            return changes;
        }

        let current: BTreeSet<TabletAlias> = snapshot.endpoints.iter().map(Endpoint::alias).collect();
        let gone: Vec<TabletAlias> = self
            .inner
            .states
            .lock()
            .values()
            .filter(|s| s.endpoint.cell == snapshot.cell && s.endpoint.target.keyspace == snapshot.keyspace)
            .map(|s| s.endpoint.alias())
            .filter(|alias| !current.contains(alias))
            .collect();

        for alias in gone {
            if self.remove_endpoint(&alias) {
                changes.removed.push(alias);
            }
        }
        changes
    }

    /// Apply the outcome of one probe.
    pub fn record_probe(&self, alias: &TabletAlias, result: Result<ProbeReport, ProbeError>) {
        self.inner.record_probe(alias, result);
    }

    /// Roles among `roles` that have no serving tablet for any target.
    pub fn missing_roles(&self, roles: &[TabletRole]) -> Vec<TabletRole> {
        let sets = self.inner.sets.load();
        roles
            .iter()
            .copied()
            .filter(|role| {
                !sets
                    .values()
                    .any(|set| set.target.role == *role && !set.is_empty())
            })
            .collect()
    }

    /// Wait until every role in `roles` has at least one serving tablet.
    ///
    /// Returns the roles still missing when `timeout` elapses.
    pub async fn wait_for_roles(&self, roles: &[TabletRole], timeout: Duration) -> Result<(), Vec<TabletRole>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut version = self.inner.version.subscribe();

        loop {
            let missing = self.missing_roles(roles);
            if missing.is_empty() {
                return Ok(());
            }
            match tokio::time::timeout_at(deadline, version.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return Err(missing),
            }
        }
    }

    fn spawn_probe_loop(&self, endpoint: Endpoint) {
        let alias = endpoint.alias();
        let weak = Arc::downgrade(&self.inner);
        let probe = self.inner.probe.clone();
        let config = self.inner.config.clone();

        let task = tokio::spawn(probe_loop(weak, probe, config, endpoint));
        if let Some(previous) = self.inner.tasks.lock().insert(alias, task) {
            previous.abort();
        }
    }
}

/// Probe one tablet until it is removed or the registry is dropped.
async fn probe_loop(
    registry: Weak<RegistryInner>,
    probe: Arc<dyn HealthProbe>,
    config: HealthRegistryConfig,
    endpoint: Endpoint,
) {
    let alias = endpoint.alias();
    loop {
        let result = match tokio::time::timeout(config.probe_timeout, probe.probe(&endpoint, config.probe_timeout)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(config.probe_timeout)),
        };

        match registry.upgrade() {
            Some(inner) => inner.record_probe(&alias, result),
            None => return,
        }

        tokio::time::sleep(config.retry_delay).await;
    }
}

impl RegistryInner {
    fn record_probe(&self, alias: &TabletAlias, result: Result<ProbeReport, ProbeError>) {
        let mut states = self.states.lock();
        let Some(entry) = states.get_mut(alias) else {
            return;
        };

        let was_serving = entry.serving;
        let old_lag = entry.replication_lag;

        match result {
            Ok(report) => {
                entry.consecutive_failures = 0;
                entry.serving = report.serving;
                entry.replication_lag = report.replication_lag;
                entry.last_error = None;
            }
            Err(error) => {
                if matches!(error, ProbeError::Timeout(_)) {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_probe_timeout(alias);
                    }
                }
                entry.consecutive_failures += 1;
                entry.last_error = Some(error.to_string());

                if entry.serving && entry.consecutive_failures >= self.config.unhealthy_threshold {
                    entry.serving = false;
                }
            }
        }
        entry.last_probe_at = Some(Instant::now());

        let changed = was_serving != entry.serving || (entry.serving && old_lag != entry.replication_lag);
        if was_serving != entry.serving {
            if entry.serving {
                tracing::info!("tablet {} is now serving", alias);
            } else {
                tracing::warn!(
                    "tablet {} is no longer serving: {}",
                    alias,
                    entry.last_error.as_deref().unwrap_or("reported not serving")
                );
            }
        }

        if changed {
            let target = entry.endpoint.target.clone();
            self.publish(&states, &target);
        }
    }

    /// Replace the published set for `target`. Callers hold the states lock,
    /// which serializes publishes.
    fn publish(&self, states: &HashMap<TabletAlias, EndpointHealth>, target: &Target) {
        let set = HealthSet::from_states(target.clone(), states.values());
        let mut sets = HealthSets::clone(&self.sets.load());
        sets.insert(target.clone(), Arc::new(set));
        self.sets.store(Arc::new(sets));
        self.version.send_modify(|v| *v += 1);
    }
}
