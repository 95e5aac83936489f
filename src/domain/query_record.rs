//! Query Attempt Record
//!
//! Per-call telemetry. The gateway and the execution stages below it fill
//! the record in while the call runs; once finished it is handed to the
//! telemetry sink and never touched again.

use crate::domain::entities::{CallerIdentity, QueryRequest, QueryResponse, TabletAlias};
use crate::domain::errors::GatewayError;
use crate::domain::value_objects::{BindValue, QuerySource, QuerySources};
use chrono::{DateTime, Local};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Layout of the start and end columns (`Jan _2 15:04:05.000000`).
const STAMP_MICRO: &str = "%b %e %H:%M:%S%.6f";

/// Stats for a single top-level call.
#[derive(Debug, Clone)]
pub struct QueryAttemptRecord {
    pub method: String,
    pub caller: CallerIdentity,
    pub plan_type: String,
    pub original_sql: String,
    pub bind_vars: BTreeMap<String, BindValue>,
    pub transaction_id: i64,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    started: Instant,
    total_time: Duration,
    /// Attempts made against tablets
    pub attempts: u32,
    /// Tablets used, in attempt order
    pub tablets: Vec<TabletAlias>,
    /// Backend round trips
    pub number_of_queries: u32,
    rewritten_sqls: Vec<String>,
    pub query_sources: QuerySources,
    pub backend_response_time: Duration,
    pub waiting_for_admission: Duration,
    pub waiting_for_connection: Duration,
    pub rows_affected: u64,
    pub response_size: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_absent: u64,
    pub cache_invalidations: u64,
    pub error: Option<GatewayError>,
}

impl QueryAttemptRecord {
    /// Start a record for a call.
    pub fn new(caller: CallerIdentity, request: &QueryRequest) -> Self {
        let now = Local::now();
        Self {
            method: request.method.clone(),
            caller,
            plan_type: request.plan_type.clone(),
            original_sql: request.sql.clone(),
            bind_vars: request.bind_vars.clone(),
            transaction_id: request.transaction_id,
            start_time: now,
            end_time: now,
            started: Instant::now(),
            total_time: Duration::ZERO,
            attempts: 0,
            tablets: Vec::new(),
            number_of_queries: 0,
            rewritten_sqls: Vec::new(),
            query_sources: QuerySources::empty(),
            backend_response_time: Duration::ZERO,
            waiting_for_admission: Duration::ZERO,
            waiting_for_connection: Duration::ZERO,
            rows_affected: 0,
            response_size: 0,
            cache_hits: 0,
            cache_misses: 0,
            cache_absent: 0,
            cache_invalidations: 0,
            error: None,
        }
    }

    /// Record one backend round trip that started at `started`.
    pub fn record_backend_round_trip(&mut self, sql: impl Into<String>, started: Instant) {
        self.record_backend_round_trip_took(sql, started.elapsed());
    }

    /// Record one backend round trip with a measured duration.
    pub fn record_backend_round_trip_took(&mut self, sql: impl Into<String>, took: Duration) {
        self.query_sources.insert(QuerySource::Backend);
        self.number_of_queries += 1;
        self.rewritten_sqls.push(sql.into());
        self.backend_response_time += took;
    }

    pub fn record_cache_hits(&mut self, n: u64) {
        self.query_sources.insert(QuerySource::Cache);
        self.cache_hits += n;
    }

    pub fn record_cache_misses(&mut self, n: u64) {
        self.cache_misses += n;
    }

    pub fn record_cache_absent(&mut self, n: u64) {
        self.query_sources.insert(QuerySource::Cache);
        self.cache_absent += n;
    }

    pub fn record_cache_invalidations(&mut self, n: u64) {
        self.cache_invalidations += n;
    }

    /// The result was shared with an identical in-flight query.
    pub fn record_consolidated(&mut self) {
        self.query_sources.insert(QuerySource::Consolidator);
    }

    pub(crate) fn record_attempt(&mut self, tablet: TabletAlias) {
        self.attempts += 1;
        self.tablets.push(tablet);
    }

    pub(crate) fn record_response(&mut self, response: &QueryResponse) {
        self.rows_affected = response.rows_affected;
        self.response_size = response.size_bytes();
    }

    /// Stamp the end time and terminal error.
    pub fn finish(&mut self, error: Option<GatewayError>) {
        self.end_time = Local::now();
        self.total_time = self.started.elapsed();
        self.error = error;
    }

    /// How long the call ran. Zero until finished.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    /// Executed statements, separated by `; `.
    pub fn rewritten_sql(&self) -> String {
        self.rewritten_sqls.join("; ")
    }

    pub fn rewritten_sqls(&self) -> &[String] {
        &self.rewritten_sqls
    }

    /// Bind variables as JSON. Unless `full` is set, text and byte values
    /// only report their type and length.
    pub fn fmt_bind_variables(&self, full: bool) -> String {
        let out: BTreeMap<&str, BindValue> = self
            .bind_vars
            .iter()
            .map(|(k, v)| (k.as_str(), if full { v.clone() } else { v.redacted() }))
            .collect();
        match serde_json::to_string(&out) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("could not marshal bind variables: {}", e);
                String::new()
            }
        }
    }

    pub fn fmt_query_sources(&self) -> String {
        self.query_sources.to_string()
    }

    pub fn error_str(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }

    /// One tab separated log line, terminated by a tab and a newline.
    pub fn format(&self, full: bool) -> String {
        format!(
            "{}\t{}\t{}\t'{}'\t'{}'\t{}\t{}\t{:.6}\t{}\t{:?}\t{}\t{}\t{:?}\t{}\t{:.6}\t{:.6}\t{}\t{}\t{}\t{}\t{}\t{}\t{:?}\t\n",
            self.method,
            self.caller.remote_addr,
            self.caller.username,
            self.caller.immediate,
            self.caller.effective,
            self.start_time.format(STAMP_MICRO),
            self.end_time.format(STAMP_MICRO),
            self.total_time.as_secs_f64(),
            self.plan_type,
            self.original_sql,
            self.fmt_bind_variables(full),
            self.number_of_queries,
            self.rewritten_sql(),
            self.fmt_query_sources(),
            self.backend_response_time.as_secs_f64(),
            self.waiting_for_connection.as_secs_f64(),
            self.rows_affected,
            self.response_size,
            self.cache_hits,
            self.cache_misses,
            self.cache_absent,
            self.cache_invalidations,
            self.error_str(),
        )
    }
}
