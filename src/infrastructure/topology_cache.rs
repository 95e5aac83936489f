//! Resilient Topology Cache
//!
//! Resolves which tablets serve a keyspace in a cell. Every resolution tries
//! the topology service first and falls back to the last known snapshot,
//! flagged stale, when the service misbehaves.

use crate::domain::entities::TopologySnapshot;
use crate::domain::errors::{GatewayError, TopologyError};
use crate::domain::ports::{GatewayMetrics, TopologyService};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Default bound on a single topology fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct EntryState {
    /// Incremented once per completed fetch
    generation: u64,
    current: Option<Arc<TopologySnapshot>>,
    last_error: Option<TopologyError>,
}

#[derive(Default)]
struct CacheEntry {
    /// Held for the duration of a fetch
    fetch_lock: tokio::sync::Mutex<()>,
    state: RwLock<EntryState>,
}

/// Topology cache keyed by (cell, keyspace).
pub struct ResilientTopologyCache {
    service: Arc<dyn TopologyService>,
    fetch_timeout: Duration,
    entries: DashMap<(String, String), Arc<CacheEntry>>,
    metrics: Option<Arc<dyn GatewayMetrics>>,
}

impl ResilientTopologyCache {
    pub fn new(service: Arc<dyn TopologyService>, fetch_timeout: Duration) -> Self {
        Self {
            service,
            fetch_timeout,
            entries: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn GatewayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Resolve the topology of `keyspace` in `cell`.
    ///
    /// Concurrent callers for the same key share one fetch: whoever arrives
    /// while a fetch is running waits for it and returns its outcome.
    pub async fn resolve(&self, cell: &str, keyspace: &str) -> Result<Arc<TopologySnapshot>, GatewayError> {
        let entry = self.entry(cell, keyspace);
        let seen = entry.state.read().generation;

        let _fetching = entry.fetch_lock.lock().await;
        {
            let state = entry.state.read();
            if state.generation != seen {
                return outcome(&state, cell, keyspace);
            }
        }

        let result = match tokio::time::timeout(self.fetch_timeout, self.service.fetch(cell, keyspace)).await {
            Ok(result) => result,
            Err(_) => Err(TopologyError::Timeout(self.fetch_timeout)),
        };

        let mut state = entry.state.write();
        state.generation += 1;
        match result {
            Ok(endpoints) => {
                let snapshot = Arc::new(TopologySnapshot::fresh(cell, keyspace, endpoints));
                state.current = Some(snapshot.clone());
                state.last_error = None;
                Ok(snapshot)
            }
            Err(error) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_topology_fetch_failure(keyspace);
                }
                let fallback = state.current.as_ref().map(|s| Arc::new(s.to_stale()));
                match &fallback {
                    Some(stale) => tracing::warn!(
                        "topology fetch for {}/{} failed, serving stale snapshot of {} tablets: {}",
                        cell,
                        keyspace,
                        stale.endpoints.len(),
                        error
                    ),
                    None => tracing::warn!("topology fetch for {}/{} failed: {}", cell, keyspace, error),
                }
                if fallback.is_some() {
                    state.current = fallback;
                }
                state.last_error = Some(error);
                outcome(&state, cell, keyspace)
            }
        }
    }

    /// Last known snapshot without contacting the topology service.
    pub fn cached(&self, cell: &str, keyspace: &str) -> Option<Arc<TopologySnapshot>> {
        self.entries
            .get(&(cell.to_string(), keyspace.to_string()))
            .and_then(|entry| entry.value().state.read().current.clone())
    }

    /// Number of (cell, keyspace) keys seen so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, cell: &str, keyspace: &str) -> Arc<CacheEntry> {
        self.entries
            .entry((cell.to_string(), keyspace.to_string()))
            .or_default()
            .value()
            .clone()
    }
}

fn outcome(state: &EntryState, cell: &str, keyspace: &str) -> Result<Arc<TopologySnapshot>, GatewayError> {
    match &state.current {
        Some(snapshot) => Ok(snapshot.clone()),
        None => Err(GatewayError::TargetUnresolved {
            cell: cell.to_string(),
            keyspace: keyspace.to_string(),
            reason: state
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "no topology".to_string()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::Endpoint;
    use crate::domain::value_objects::{TabletRole, Target};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    /// Topology service replaying scripted answers in order.
    #[derive(Default)]
    struct ScriptedTopology {
        answers: Mutex<VecDeque<Result<Vec<Endpoint>, TopologyError>>>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedTopology {
        fn with(answers: Vec<Result<Vec<Endpoint>, TopologyError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl TopologyService for ScriptedTopology {
        async fn fetch(&self, _cell: &str, keyspace: &str) -> Result<Vec<Endpoint>, TopologyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.answers
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(TopologyError::NoNode(keyspace.to_string())))
        }
    }

    fn endpoints(uids: &[u32]) -> Vec<Endpoint> {
        uids.iter()
            .map(|uid| {
                Endpoint::new(
                    "zone1",
                    Target::new("ks", "0", TabletRole::Replica),
                    *uid,
                    "10.0.0.1",
                    15000,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_fetch() {
        let service = Arc::new(ScriptedTopology::with(vec![Ok(endpoints(&[1, 2]))]));
        let cache = ResilientTopologyCache::new(service, DEFAULT_FETCH_TIMEOUT);

        let snapshot = cache.resolve("zone1", "ks").await.unwrap();
        assert!(!snapshot.stale);
        assert_eq!(snapshot.endpoints.len(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failure_returns_stale_snapshot() {
        let service = Arc::new(ScriptedTopology::with(vec![
            Ok(endpoints(&[1, 2])),
            Err(TopologyError::Unavailable("connection reset".into())),
        ]));
        let cache = ResilientTopologyCache::new(service, DEFAULT_FETCH_TIMEOUT);

        let first = cache.resolve("zone1", "ks").await.unwrap();
        let second = cache.resolve("zone1", "ks").await.unwrap();

        assert!(second.stale);
        assert_eq!(second.endpoints, first.endpoints);
        assert_eq!(second.fetched_at, first.fetched_at);
        assert!(logs_contain("serving stale snapshot"));
    }

    #[tokio::test]
    async fn test_recovers_after_stale() {
        let service = Arc::new(ScriptedTopology::with(vec![
            Ok(endpoints(&[1])),
            Err(TopologyError::Unavailable("down".into())),
            Ok(endpoints(&[1, 3])),
        ]));
        let cache = ResilientTopologyCache::new(service, DEFAULT_FETCH_TIMEOUT);

        cache.resolve("zone1", "ks").await.unwrap();
        assert!(cache.resolve("zone1", "ks").await.unwrap().stale);

        let recovered = cache.resolve("zone1", "ks").await.unwrap();
        assert!(!recovered.stale);
        assert_eq!(recovered.endpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_never_fetched_is_unresolved() {
        let service = Arc::new(ScriptedTopology::with(vec![Err(TopologyError::NoNode("ks".into()))]));
        let cache = ResilientTopologyCache::new(service, DEFAULT_FETCH_TIMEOUT);

        let err = cache.resolve("zone1", "ks").await.unwrap_err();
        match err {
            GatewayError::TargetUnresolved { cell, keyspace, reason } => {
                assert_eq!(cell, "zone1");
                assert_eq!(keyspace, "ks");
                assert_eq!(reason, "keyspace ks not found");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.cached("zone1", "ks").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_fetch_times_out() {
        let service = Arc::new(ScriptedTopology {
            answers: Mutex::new(vec![Ok(endpoints(&[1]))].into()),
            delay: Duration::from_secs(10),
            calls: AtomicU32::new(0),
        });
        let cache = ResilientTopologyCache::new(service, Duration::from_millis(100));

        let err = cache.resolve("zone1", "ks").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolutions_share_one_fetch() {
        let service = Arc::new(ScriptedTopology {
            answers: Mutex::new(vec![Ok(endpoints(&[1])), Ok(endpoints(&[1, 2]))].into()),
            delay: Duration::from_millis(50),
            calls: AtomicU32::new(0),
        });
        let cache = Arc::new(ResilientTopologyCache::new(service.clone(), DEFAULT_FETCH_TIMEOUT));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.resolve("zone1", "ks").await }));
        }
        for task in tasks {
            let snapshot = task.await.unwrap().unwrap();
            assert_eq!(snapshot.endpoints.len(), 1);
        }
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let service = Arc::new(ScriptedTopology::with(vec![
            Ok(endpoints(&[1])),
            Err(TopologyError::NoNode("other".into())),
        ]));
        let cache = ResilientTopologyCache::new(service, DEFAULT_FETCH_TIMEOUT);

        assert!(cache.resolve("zone1", "ks").await.is_ok());
        assert!(cache.resolve("zone1", "other").await.is_err());
        assert!(cache.cached("zone1", "ks").is_some());
    }
}
