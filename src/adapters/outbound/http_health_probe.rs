//! HTTP Health Probe
//!
//! Asks a tablet's status endpoint whether it is serving. The endpoint
//! answers `GET /healthz` with `{"serving": bool, "replication_lag_secs": n}`;
//! any non-2xx status means not serving.

use crate::domain::entities::{Endpoint, ProbeReport};
use crate::domain::errors::ProbeError;
use crate::domain::ports::HealthProbe;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_HEALTH_PATH: &str = "/healthz";

#[derive(Debug, Deserialize)]
struct HealthBody {
    serving: bool,
    #[serde(default)]
    replication_lag_secs: f64,
}

pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
    /// Overrides the tablet's serving port when set
    port: Option<u16>,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::with_path(DEFAULT_HEALTH_PATH)
    }

    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            path: path.into(),
            port: None,
        }
    }

    /// Probe `port` instead of the tablet's serving port.
    pub fn on_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    fn url(&self, endpoint: &Endpoint) -> String {
        let port = self.port.unwrap_or(endpoint.port);
        format!("http://{}:{}{}", endpoint.host, port, self.path)
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<ProbeReport, ProbeError> {
        let resp = match self.client.get(self.url(endpoint)).timeout(timeout).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(ProbeError::Timeout(timeout)),
            Err(e) => return Err(ProbeError::Failed(format!("request failed: {}", e))),
        };

        if !resp.status().is_success() {
            tracing::debug!("tablet {} answered {}", endpoint.alias(), resp.status());
            return Ok(ProbeReport::not_serving());
        }

        let body: HealthBody = resp
            .json()
            .await
            .map_err(|e| ProbeError::Failed(format!("invalid health body: {}", e)))?;

        if !body.serving {
            return Ok(ProbeReport::not_serving());
        }
        let lag = Duration::try_from_secs_f64(body.replication_lag_secs).unwrap_or(Duration::ZERO);
        Ok(ProbeReport::serving(lag))
    }
}
