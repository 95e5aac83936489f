//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Replication role of a tablet.
///
/// The role decides routing eligibility: writes go to the primary,
/// reads may be served by replicas or batch (rdonly) tablets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabletRole {
    Primary,
    Replica,
    Rdonly,
}

impl TabletRole {
    /// Parse a role name. Accepts the legacy `master` spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "primary" | "master" => Some(Self::Primary),
            "replica" => Some(Self::Replica),
            "rdonly" | "batch" => Some(Self::Rdonly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Replica => "replica",
            Self::Rdonly => "rdonly",
        }
    }
}

impl fmt::Display for TabletRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Logical routing target: a keyspace, one of its shards, and a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub keyspace: String,
    pub shard: String,
    pub role: TabletRole,
}

impl Target {
    pub fn new(keyspace: impl Into<String>, shard: impl Into<String>, role: TabletRole) -> Self {
        Self {
            keyspace: keyspace.into(),
            shard: shard.into(),
            role,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.keyspace, self.shard, self.role)
    }
}

/// A bind parameter or result value.
///
/// Serializes untagged, so a map of values renders as plain JSON
/// (`{"id":42,"name":"bob"}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BindValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl BindValue {
    /// Placeholder used in the query log instead of the payload itself.
    ///
    /// Text and byte values are reduced to their type and length; every
    /// other variant is returned unchanged.
    pub fn redacted(&self) -> BindValue {
        match self {
            Self::Text(s) => Self::Text(format!("string {}", s.len())),
            Self::Bytes(b) => Self::Text(format!("bytes {}", b.len())),
            other => other.clone(),
        }
    }

    /// Approximate encoded length of the value in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Integer(i) => i.to_string().len(),
            Self::Float(f) => f.to_string().len(),
            Self::Text(s) => s.len(),
            Self::Bytes(b) => b.len(),
        }
    }
}

impl From<i64> for BindValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for BindValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for BindValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// Where a query result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuerySource {
    Backend,
    Cache,
    Consolidator,
}

impl QuerySource {
    /// All sources in formatting order.
    pub const ALL: [QuerySource; 3] = [Self::Backend, Self::Cache, Self::Consolidator];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::Cache => "cache",
            Self::Consolidator => "consolidator",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Self::Backend => 1,
            Self::Cache => 1 << 1,
            Self::Consolidator => 1 << 2,
        }
    }
}

/// Set of sources that contributed to a result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuerySources(u8);

impl QuerySources {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn insert(&mut self, source: QuerySource) {
        self.0 |= source.bit();
    }

    pub fn contains(&self, source: QuerySource) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = QuerySource> + '_ {
        QuerySource::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl FromIterator<QuerySource> for QuerySources {
    fn from_iter<I: IntoIterator<Item = QuerySource>>(iter: I) -> Self {
        let mut set = Self::empty();
        for source in iter {
            set.insert(source);
        }
        set
    }
}

impl fmt::Display for QuerySources {
    /// Comma separated in fixed order, or `none` when empty.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<&str> = self.iter().map(|s| s.as_str()).collect();
        f.write_str(&names.join(","))
    }
}
