//! Endpoint Selector Service
//!
//! Pure domain logic for choosing which tablet an attempt goes to.
//! This service has NO external dependencies - it's pure Rust.

use crate::domain::entities::{EndpointHealth, HealthSet, TabletAlias};
use std::time::Instant;

/// Picks the tablet for the next attempt of a call.
///
/// Selection order:
/// 1. Tablets not yet tried by this call (all tablets once every one has been tried)
/// 2. Lowest replication lag
/// 3. Least recently used (never used first)
pub struct EndpointSelector;

impl EndpointSelector {
    /// Select a tablet from `set`.
    ///
    /// # Arguments
    /// * `set` - Health set snapshot held by the call
    /// * `tried` - Tablets already attempted by this call
    /// * `last_used` - Closure returning when a tablet was last handed an attempt
    ///
    /// # Returns
    /// The chosen tablet, or None if the set is empty
    pub fn pick<'a, F>(
        set: &'a HealthSet,
        tried: &[TabletAlias],
        last_used: F,
    ) -> Option<&'a EndpointHealth>
    where
        F: Fn(&TabletAlias) -> Option<Instant>,
    {
        let untried: Vec<&EndpointHealth> = set
            .endpoints
            .iter()
            .filter(|e| !tried.contains(&e.endpoint.alias()))
            .collect();

        let candidates: Vec<&EndpointHealth> = if untried.is_empty() {
            set.endpoints.iter().collect()
        } else {
            untried
        };

        candidates
            .into_iter()
            .min_by_key(|e| (e.replication_lag, last_used(&e.endpoint.alias())))
    }
}
