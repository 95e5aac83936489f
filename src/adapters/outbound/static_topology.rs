//! Static Topology
//!
//! TopologyService backed by an in-memory tablet list, parsed from
//! `cell/keyspace/shard/role/uid@host:port` entries separated by `;`.

use crate::config::ConfigError;
use crate::domain::entities::Endpoint;
use crate::domain::errors::TopologyError;
use crate::domain::ports::TopologyService;
use crate::domain::value_objects::{TabletRole, Target};
use async_trait::async_trait;

/// In-memory topology.
pub struct StaticTopology {
    endpoints: Vec<Endpoint>,
}

impl StaticTopology {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }

    /// Parse a `;` separated list of tablet entries.
    pub fn parse(entries: &str) -> Result<Self, ConfigError> {
        let endpoints = entries
            .split(';')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(parse_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(endpoints))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Distinct (cell, keyspace) pairs present.
    pub fn keyspaces(&self) -> Vec<(String, String)> {
        let mut keys: Vec<(String, String)> = self
            .endpoints
            .iter()
            .map(|e| (e.cell.clone(), e.target.keyspace.clone()))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}

fn parse_entry(entry: &str) -> Result<Endpoint, ConfigError> {
    let invalid = |reason: &str| ConfigError::TopologyEntry {
        entry: entry.to_string(),
        reason: reason.to_string(),
    };

    let (path, addr) = entry.split_once('@').ok_or_else(|| invalid("missing @host:port"))?;
    let parts: Vec<&str> = path.split('/').collect();
    let [cell, keyspace, shard, role, uid] = parts.as_slice() else {
        return Err(invalid("expected cell/keyspace/shard/role/uid"));
    };
    if cell.is_empty() || keyspace.is_empty() || shard.is_empty() {
        return Err(invalid("empty cell, keyspace or shard"));
    }

    let role = TabletRole::parse(role).ok_or_else(|| invalid("unknown tablet type"))?;
    let uid: u32 = uid.parse().map_err(|_| invalid("uid is not a number"))?;

    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number"))?;
    if host.is_empty() {
        return Err(invalid("empty host"));
    }

    Ok(Endpoint::new(*cell, Target::new(*keyspace, *shard, role), uid, host, port))
}

#[async_trait]
impl TopologyService for StaticTopology {
    async fn fetch(&self, cell: &str, keyspace: &str) -> Result<Vec<Endpoint>, TopologyError> {
        let endpoints: Vec<Endpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.cell == cell && e.target.keyspace == keyspace)
            .cloned()
            .collect();

        if endpoints.is_empty() {
            return Err(TopologyError::NoNode(keyspace.to_string()));
        }
        Ok(endpoints)
    }
}
