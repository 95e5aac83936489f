//! Gateway Metrics Port
//!
//! Defines the interface for counting what happens on the serving path.

use crate::domain::entities::TabletAlias;

/// Counters for calls, tablets and the degraded paths the gateway absorbs.
///
/// Every method must be cheap and non-blocking; it is called on the
/// serving path.
pub trait GatewayMetrics: Send + Sync {
    /// An attempt was sent to a tablet.
    fn record_attempt(&self, tablet: &TabletAlias);

    /// An attempt against a tablet failed.
    fn record_attempt_failure(&self, tablet: &TabletAlias);

    /// A connection to a tablet was opened.
    fn connection_opened(&self, tablet: &TabletAlias);

    /// A connection to a tablet was closed or discarded.
    fn connection_closed(&self, tablet: &TabletAlias);

    /// A topology refresh failed and cached data was served instead.
    fn record_topology_fetch_failure(&self, keyspace: &str);

    /// A health probe timed out.
    fn record_probe_timeout(&self, tablet: &TabletAlias);

    /// A call was turned away at admission.
    fn record_admission_rejected(&self);

    /// Number of attempts sent to a tablet so far.
    fn attempt_count(&self, tablet: &TabletAlias) -> u64;

    /// Number of open connections to a tablet.
    fn connection_count(&self, tablet: &TabletAlias) -> usize;
}
