//! TCP Health Probe
//!
//! A tablet is serving if its port accepts a connection. Replication lag
//! is not observable this way and is reported as zero.

use crate::domain::entities::{Endpoint, ProbeReport};
use crate::domain::errors::ProbeError;
use crate::domain::ports::HealthProbe;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpHealthProbe;

impl TcpHealthProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn probe(&self, endpoint: &Endpoint, timeout: Duration) -> Result<ProbeReport, ProbeError> {
        match tokio::time::timeout(timeout, TcpStream::connect(endpoint.addr())).await {
            Ok(Ok(mut stream)) => {
                let _ = stream.shutdown().await;
                Ok(ProbeReport::serving(Duration::ZERO))
            }
            Ok(Err(e)) => Err(ProbeError::Failed(format!("connection failed: {}", e))),
            Err(_) => Err(ProbeError::Timeout(timeout)),
        }
    }
}
