use crate::application::GatewaySettings;
use crate::domain::value_objects::TabletRole;
use crate::infrastructure::admission::AdmissionMode;
use crate::infrastructure::connection_pool::PoolConfig;
use crate::infrastructure::health_registry::HealthRegistryConfig;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const ONE_YEAR_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    // Routing
    pub cell: String,
    pub retry_delay_ms: u64,
    pub retry_count: u32,
    pub conn_timeout_total_ms: u64,
    pub conn_timeout_per_conn_ms: u64,
    pub conn_life_secs: u64,

    // Admission
    pub max_in_flight: usize,
    pub reject_when_saturated: bool,

    // Health checking
    pub health_check_retry_delay_ms: u64,
    pub health_check_timeout_ms: u64,
    pub unhealthy_threshold: u32,
    pub tablet_types_to_wait: Vec<TabletRole>,

    // Topology
    pub topology_fetch_timeout_ms: u64,
    pub static_topology: String,

    // Status surface
    pub query_log_buffer: usize,
    pub status_listen_addr: String,
    pub debug: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cell: "test_nj".to_string(),
            retry_delay_ms: 2,
            retry_count: 2,
            conn_timeout_total_ms: 3000,
            conn_timeout_per_conn_ms: 1500,
            conn_life_secs: ONE_YEAR_SECS,
            max_in_flight: 0,
            reject_when_saturated: false,
            health_check_retry_delay_ms: 2,
            health_check_timeout_ms: 60_000,
            unhealthy_threshold: 3,
            tablet_types_to_wait: Vec::new(),
            topology_fetch_timeout_ms: 1000,
            static_topology: String::new(),
            query_log_buffer: 50,
            status_listen_addr: "0.0.0.0:15001".to_string(),
            debug: false,
        }
    }
}

/// Invalid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("invalid topology entry {entry:?}: {reason}")]
    TopologyEntry { entry: String, reason: String },
}

impl GatewayConfig {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conn_timeout_total_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "conn_timeout_total_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.conn_timeout_per_conn_ms > self.conn_timeout_total_ms {
            return Err(ConfigError::Invalid {
                name: "conn_timeout_per_conn_ms",
                reason: format!(
                    "{} exceeds the total timeout of {}",
                    self.conn_timeout_per_conn_ms, self.conn_timeout_total_ms
                ),
            });
        }
        if self.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid {
                name: "unhealthy_threshold",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            cell: self.cell.clone(),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            retry_count: self.retry_count,
            timeout_total: Duration::from_millis(self.conn_timeout_total_ms),
            timeout_per_conn: Duration::from_millis(self.conn_timeout_per_conn_ms),
            max_in_flight: self.max_in_flight,
            admission_mode: if self.reject_when_saturated {
                AdmissionMode::Reject
            } else {
                AdmissionMode::Block
            },
        }
    }

    pub fn health_registry_config(&self) -> HealthRegistryConfig {
        HealthRegistryConfig {
            retry_delay: Duration::from_millis(self.health_check_retry_delay_ms),
            probe_timeout: Duration::from_millis(self.health_check_timeout_ms),
            unhealthy_threshold: self.unhealthy_threshold,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            conn_life: Duration::from_secs(self.conn_life_secs),
            ..PoolConfig::default()
        }
    }

    pub fn topology_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.topology_fetch_timeout_ms)
    }

    /// Time to wait for `tablet_types_to_wait` at startup.
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Parse a comma separated list of tablet types. Unknown types are logged
/// and skipped.
pub fn parse_tablet_types(list: &str) -> Vec<TabletRole> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match TabletRole::parse(s) {
            Some(role) => Some(role),
            None => {
                tracing::error!("unknown tablet type {:?} in tablet_types_to_wait, skipping", s);
                None
            }
        })
        .collect()
}

pub fn load_config() -> anyhow::Result<GatewayConfig> {
    let defaults = GatewayConfig::default();

    let cell = std::env::var("TABLETGW_CELL").unwrap_or(defaults.cell);

    let retry_delay_ms = env_or("TABLETGW_RETRY_DELAY_MS", defaults.retry_delay_ms);
    let retry_count = env_or("TABLETGW_RETRY_COUNT", defaults.retry_count);
    let conn_timeout_total_ms = env_or("TABLETGW_CONN_TIMEOUT_TOTAL_MS", defaults.conn_timeout_total_ms);
    let conn_timeout_per_conn_ms = env_or("TABLETGW_CONN_TIMEOUT_PER_CONN_MS", defaults.conn_timeout_per_conn_ms);
    let conn_life_secs = env_or("TABLETGW_CONN_LIFE_SECS", defaults.conn_life_secs);

    // Admission
    let max_in_flight = env_or("TABLETGW_MAX_IN_FLIGHT", defaults.max_in_flight);
    let reject_when_saturated = env_flag("TABLETGW_REJECT_WHEN_SATURATED");

    // Health checking
    let health_check_retry_delay_ms = env_or("TABLETGW_HEALTHCHECK_RETRY_DELAY_MS", defaults.health_check_retry_delay_ms);
    let health_check_timeout_ms = env_or("TABLETGW_HEALTHCHECK_TIMEOUT_MS", defaults.health_check_timeout_ms);
    let unhealthy_threshold = env_or("TABLETGW_UNHEALTHY_THRESHOLD", defaults.unhealthy_threshold);
    let tablet_types_to_wait = std::env::var("TABLETGW_TABLET_TYPES_TO_WAIT")
        .map(|v| parse_tablet_types(&v))
        .unwrap_or_default();

    // Topology
    let topology_fetch_timeout_ms = env_or("TABLETGW_TOPO_FETCH_TIMEOUT_MS", defaults.topology_fetch_timeout_ms);
    let static_topology = std::env::var("TABLETGW_STATIC_TOPOLOGY").unwrap_or_default();

    // Status surface
    let query_log_buffer = env_or("TABLETGW_QUERYLOG_BUFFER", defaults.query_log_buffer);
    let status_listen_addr = std::env::var("TABLETGW_STATUS_LISTEN_ADDR").unwrap_or(defaults.status_listen_addr);
    let debug = std::env::var("DEBUG").is_ok();

    Ok(GatewayConfig {
        cell,
        retry_delay_ms,
        retry_count,
        conn_timeout_total_ms,
        conn_timeout_per_conn_ms,
        conn_life_secs,
        max_in_flight,
        reject_when_saturated,
        health_check_retry_delay_ms,
        health_check_timeout_ms,
        unhealthy_threshold,
        tablet_types_to_wait,
        topology_fetch_timeout_ms,
        static_topology,
        query_log_buffer,
        status_listen_addr,
        debug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.cell, "test_nj");
        assert_eq!(cfg.retry_delay_ms, 2);
        assert_eq!(cfg.retry_count, 2);
        assert_eq!(cfg.conn_timeout_total_ms, 3000);
        assert_eq!(cfg.conn_timeout_per_conn_ms, 1500);
        assert_eq!(cfg.conn_life_secs, 365 * 24 * 3600);
        assert_eq!(cfg.max_in_flight, 0);
        assert!(!cfg.reject_when_saturated);
        assert_eq!(cfg.query_log_buffer, 50);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_gateway_settings_from_config() {
        let cfg = GatewayConfig {
            reject_when_saturated: true,
            max_in_flight: 8,
            ..Default::default()
        };
        let settings = cfg.gateway_settings();
        assert_eq!(settings.timeout_total, Duration::from_secs(3));
        assert_eq!(settings.timeout_per_conn, Duration::from_millis(1500));
        assert_eq!(settings.max_in_flight, 8);
        assert_eq!(settings.admission_mode, AdmissionMode::Reject);
    }

    #[test]
    fn test_health_and_pool_config_from_config() {
        let cfg = GatewayConfig::default();
        let health = cfg.health_registry_config();
        assert_eq!(health.retry_delay, Duration::from_millis(2));
        assert_eq!(health.probe_timeout, Duration::from_secs(60));
        assert_eq!(cfg.pool_config().conn_life, Duration::from_secs(365 * 24 * 3600));
    }

    #[test]
    fn test_validate_zero_total_timeout() {
        let cfg = GatewayConfig {
            conn_timeout_total_ms: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid {
                name: "conn_timeout_total_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_per_conn_exceeds_total() {
        let cfg = GatewayConfig {
            conn_timeout_per_conn_ms: 5000,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.to_string(), "conn_timeout_per_conn_ms: 5000 exceeds the total timeout of 3000");
    }

    #[test]
    fn test_parse_tablet_types_skips_unknown() {
        let roles = parse_tablet_types("replica, master,bogus,,rdonly");
        assert_eq!(roles, vec![TabletRole::Replica, TabletRole::Primary, TabletRole::Rdonly]);
    }

    #[test]
    fn test_load_config_with_cell() {
        std::env::set_var("TABLETGW_CELL", "zone9");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.cell, "zone9");
        std::env::remove_var("TABLETGW_CELL");
    }

    #[test]
    fn test_load_config_with_retry_settings() {
        std::env::set_var("TABLETGW_RETRY_COUNT", "5");
        std::env::set_var("TABLETGW_RETRY_DELAY_MS", "20");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.retry_count, 5);
        assert_eq!(cfg.retry_delay_ms, 20);
        std::env::remove_var("TABLETGW_RETRY_COUNT");
        std::env::remove_var("TABLETGW_RETRY_DELAY_MS");
    }

    #[test]
    fn test_load_config_with_admission() {
        std::env::set_var("TABLETGW_MAX_IN_FLIGHT", "64");
        std::env::set_var("TABLETGW_REJECT_WHEN_SATURATED", "TRUE");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.max_in_flight, 64);
        assert!(cfg.reject_when_saturated);
        std::env::remove_var("TABLETGW_MAX_IN_FLIGHT");
        std::env::remove_var("TABLETGW_REJECT_WHEN_SATURATED");
    }

    #[test]
    fn test_load_config_with_tablet_types() {
        std::env::set_var("TABLETGW_TABLET_TYPES_TO_WAIT", "primary,replica");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.tablet_types_to_wait, vec![TabletRole::Primary, TabletRole::Replica]);
        std::env::remove_var("TABLETGW_TABLET_TYPES_TO_WAIT");
    }

    #[test]
    fn test_load_config_parse_error_uses_default() {
        std::env::set_var("TABLETGW_UNHEALTHY_THRESHOLD", "not_a_number");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.unhealthy_threshold, 3); // default
        std::env::remove_var("TABLETGW_UNHEALTHY_THRESHOLD");
    }

    #[test]
    fn test_load_config_with_status_addr() {
        std::env::set_var("TABLETGW_STATUS_LISTEN_ADDR", "127.0.0.1:9100");
        let cfg = load_config().unwrap();
        assert_eq!(cfg.status_listen_addr, "127.0.0.1:9100");
        std::env::remove_var("TABLETGW_STATUS_LISTEN_ADDR");
    }
}
