//! DashMap Gateway Metrics
//!
//! Implements GatewayMetrics using DashMap for lock-free concurrent access.

use crate::domain::entities::TabletAlias;
use crate::domain::ports::GatewayMetrics;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for a single tablet.
#[derive(Debug, Default)]
pub struct TabletMetrics {
    /// Attempts routed to the tablet
    pub attempts: AtomicU64,
    /// Attempts that failed
    pub failures: AtomicU64,
    /// Connections currently open
    pub open_conns: AtomicUsize,
}

/// Point-in-time copy of every counter, for status output.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tablets: BTreeMap<String, TabletCounters>,
    pub topology_fetch_failures: BTreeMap<String, u64>,
    pub probe_timeouts: u64,
    pub admission_rejected: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct TabletCounters {
    pub attempts: u64,
    pub failures: u64,
    pub open_conns: usize,
}

/// DashMap-backed gateway counters. Each tablet has its own entry.
#[derive(Default)]
pub struct DashMapGatewayMetrics {
    tablets: DashMap<TabletAlias, TabletMetrics>,
    topology_fetch_failures: DashMap<String, AtomicU64>,
    probe_timeouts: AtomicU64,
    admission_rejected: AtomicU64,
}

impl DashMapGatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let tablets = self
            .tablets
            .iter()
            .map(|e| {
                (
                    e.key().to_string(),
                    TabletCounters {
                        attempts: e.attempts.load(Ordering::Relaxed),
                        failures: e.failures.load(Ordering::Relaxed),
                        open_conns: e.open_conns.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        let topology_fetch_failures = self
            .topology_fetch_failures
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            tablets,
            topology_fetch_failures,
            probe_timeouts: self.probe_timeouts.load(Ordering::Relaxed),
            admission_rejected: self.admission_rejected.load(Ordering::Relaxed),
        }
    }
}

impl GatewayMetrics for DashMapGatewayMetrics {
    fn record_attempt(&self, tablet: &TabletAlias) {
        self.tablets
            .entry(tablet.clone())
            .or_default()
            .attempts
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_attempt_failure(&self, tablet: &TabletAlias) {
        self.tablets
            .entry(tablet.clone())
            .or_default()
            .failures
            .fetch_add(1, Ordering::Relaxed);
    }

    fn connection_opened(&self, tablet: &TabletAlias) {
        self.tablets
            .entry(tablet.clone())
            .or_default()
            .open_conns
            .fetch_add(1, Ordering::Relaxed);
    }

    fn connection_closed(&self, tablet: &TabletAlias) {
        if let Some(m) = self.tablets.get(tablet) {
            // Use compare_exchange loop to prevent underflow
            let mut current = m.open_conns.load(Ordering::Relaxed);
            while current > 0 {
                match m.open_conns.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(c) => current = c,
                }
            }
        }
    }

    fn record_topology_fetch_failure(&self, keyspace: &str) {
        self.topology_fetch_failures
            .entry(keyspace.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_probe_timeout(&self, _tablet: &TabletAlias) {
        self.probe_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_admission_rejected(&self) {
        self.admission_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn attempt_count(&self, tablet: &TabletAlias) -> u64 {
        self.tablets
            .get(tablet)
            .map(|m| m.attempts.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn connection_count(&self, tablet: &TabletAlias) -> usize {
        self.tablets
            .get(tablet)
            .map(|m| m.open_conns.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tablet(uid: u32) -> TabletAlias {
        TabletAlias {
            cell: "zone1".to_string(),
            uid,
        }
    }

    #[test]
    fn test_unknown_tablet_is_zero() {
        let metrics = DashMapGatewayMetrics::new();
        assert_eq!(metrics.attempt_count(&tablet(1)), 0);
        assert_eq!(metrics.connection_count(&tablet(1)), 0);
    }

    #[test]
    fn test_attempts_and_failures() {
        let metrics = DashMapGatewayMetrics::new();
        metrics.record_attempt(&tablet(1));
        metrics.record_attempt(&tablet(1));
        metrics.record_attempt_failure(&tablet(1));

        assert_eq!(metrics.attempt_count(&tablet(1)), 2);
        let snapshot = metrics.snapshot();
        let counters = &snapshot.tablets["zone1-0000000001"];
        assert_eq!(counters.attempts, 2);
        assert_eq!(counters.failures, 1);
    }

    #[test]
    fn test_connection_closed_no_underflow() {
        let metrics = DashMapGatewayMetrics::new();
        metrics.connection_opened(&tablet(1));
        metrics.connection_closed(&tablet(1));
        metrics.connection_closed(&tablet(1));
        metrics.connection_closed(&tablet(2));
        assert_eq!(metrics.connection_count(&tablet(1)), 0);
    }

    #[test]
    fn test_global_counters() {
        let metrics = DashMapGatewayMetrics::new();
        metrics.record_topology_fetch_failure("commerce");
        metrics.record_topology_fetch_failure("commerce");
        metrics.record_probe_timeout(&tablet(1));
        metrics.record_admission_rejected();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.topology_fetch_failures["commerce"], 2);
        assert_eq!(snapshot.probe_timeouts, 1);
        assert_eq!(snapshot.admission_rejected, 1);
    }

    #[test]
    fn test_concurrent_attempts() {
        let metrics = Arc::new(DashMapGatewayMetrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    m.record_attempt(&tablet(1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.attempt_count(&tablet(1)), 1000);
    }
}
