//! Domain Entities - Core business objects
//!
//! These entities represent the core concepts of the gateway domain:
//! tablets, their health, topology snapshots and the calls routed to them.

use crate::domain::value_objects::{BindValue, TabletRole, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A tablet that can serve queries for one shard in one role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Cell (failure domain) the tablet runs in
    pub cell: String,
    /// Keyspace, shard and role served
    pub target: Target,
    /// Instance id, unique within the cell
    pub uid: u32,
    /// Host name or IP
    pub host: String,
    /// Serving port
    pub port: u16,
}

impl Endpoint {
    pub fn new(
        cell: impl Into<String>,
        target: Target,
        uid: u32,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            cell: cell.into(),
            target,
            uid,
            host: host.into(),
            port,
        }
    }

    /// Stable identity of the tablet (`cell-0000000100`).
    pub fn alias(&self) -> TabletAlias {
        TabletAlias {
            cell: self.cell.clone(),
            uid: self.uid,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn role(&self) -> TabletRole {
        self.target.role
    }
}

/// Unique tablet identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabletAlias {
    pub cell: String,
    pub uid: u32,
}

impl fmt::Display for TabletAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:010}", self.cell, self.uid)
    }
}

/// Health of one endpoint at the time a health set was published.
#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub endpoint: Endpoint,
    /// Whether the tablet is serving
    pub serving: bool,
    /// When the last probe completed
    pub last_probe_at: Option<Instant>,
    /// Consecutive failed probes
    pub consecutive_failures: u32,
    /// Replication lag reported by the last successful probe
    pub replication_lag: Duration,
    /// Last probe error
    pub last_error: Option<String>,
}

impl EndpointHealth {
    /// Initial state for a newly discovered endpoint: not serving until
    /// a probe says otherwise.
    pub fn discovered(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            serving: false,
            last_probe_at: None,
            consecutive_failures: 0,
            replication_lag: Duration::ZERO,
            last_error: None,
        }
    }
}

/// The serving endpoints of one target, ordered lowest lag first.
///
/// Published as a whole and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct HealthSet {
    pub target: Target,
    pub endpoints: Vec<EndpointHealth>,
    pub published_at: Instant,
}

impl HealthSet {
    /// Build a set from endpoint states, keeping only serving endpoints.
    pub fn from_states<'a, I>(target: Target, states: I) -> Self
    where
        I: IntoIterator<Item = &'a EndpointHealth>,
    {
        let mut endpoints: Vec<EndpointHealth> = states
            .into_iter()
            .filter(|s| s.serving && s.endpoint.target == target)
            .cloned()
            .collect();
        endpoints.sort_by_key(|s| (s.replication_lag, s.endpoint.uid));
        Self {
            target,
            endpoints,
            published_at: Instant::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn contains(&self, alias: &TabletAlias) -> bool {
        self.endpoints.iter().any(|e| &e.endpoint.alias() == alias)
    }
}

/// Cached topology of one keyspace in one cell.
#[derive(Debug, Clone)]
pub struct TopologySnapshot {
    pub cell: String,
    pub keyspace: String,
    pub endpoints: Vec<Endpoint>,
    /// True when the last refresh failed and this is older data
    pub stale: bool,
    /// When the data was fetched from the topology service
    pub fetched_at: Instant,
}

impl TopologySnapshot {
    pub fn fresh(cell: &str, keyspace: &str, endpoints: Vec<Endpoint>) -> Self {
        Self {
            cell: cell.to_string(),
            keyspace: keyspace.to_string(),
            endpoints,
            stale: false,
            fetched_at: Instant::now(),
        }
    }

    /// Same data, flagged stale.
    pub fn to_stale(&self) -> Self {
        Self {
            stale: true,
            ..self.clone()
        }
    }
}

/// Who is making a call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Authenticated user of the connection that delivered the call
    pub immediate: String,
    /// Principal the call is made on behalf of
    pub effective: String,
    /// Peer address of the client connection
    pub remote_addr: String,
    /// Username presented by the client connection
    pub username: String,
}

impl CallerIdentity {
    pub fn new(immediate: impl Into<String>, effective: impl Into<String>) -> Self {
        Self {
            immediate: immediate.into(),
            effective: effective.into(),
            ..Default::default()
        }
    }

    pub fn with_call_info(mut self, remote_addr: impl Into<String>, username: impl Into<String>) -> Self {
        self.remote_addr = remote_addr.into();
        self.username = username.into();
        self
    }
}

/// A query to run on a tablet.
#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// RPC method name used in the query log
    pub method: String,
    pub sql: String,
    pub bind_vars: BTreeMap<String, BindValue>,
    /// Plan or operation type, filled in by the planner
    pub plan_type: String,
    /// Transaction the query belongs to (0 = none)
    pub transaction_id: i64,
}

impl QueryRequest {
    pub fn new(method: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            sql: sql.into(),
            ..Default::default()
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<BindValue>) -> Self {
        self.bind_vars.insert(name.into(), value.into());
        self
    }

    pub fn with_plan_type(mut self, plan_type: impl Into<String>) -> Self {
        self.plan_type = plan_type.into();
        self
    }
}

/// Result rows of a query.
pub type Row = Vec<BindValue>;

/// Result of a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    pub rows_affected: u64,
    pub rows: Vec<Row>,
}

impl QueryResponse {
    /// Approximate size of the rows in bytes, ignoring protocol encoding.
    pub fn size_bytes(&self) -> usize {
        self.rows
            .iter()
            .flat_map(|row| row.iter())
            .map(BindValue::encoded_len)
            .sum()
    }
}

/// Outcome of one health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub serving: bool,
    pub replication_lag: Duration,
}

impl ProbeReport {
    pub fn serving(replication_lag: Duration) -> Self {
        Self {
            serving: true,
            replication_lag,
        }
    }

    pub fn not_serving() -> Self {
        Self {
            serving: false,
            replication_lag: Duration::ZERO,
        }
    }
}

/// Shared handle to a published health set.
pub type SharedHealthSet = Arc<HealthSet>;
