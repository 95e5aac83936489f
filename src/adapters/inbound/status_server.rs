//! Status Server
//!
//! HTTP surface for operators: readiness, tablet health, counters and a
//! live stream of the query log.

use crate::adapters::outbound::{DashMapGatewayMetrics, MetricsSnapshot, StreamLogger};
use crate::domain::entities::EndpointHealth;
use crate::domain::value_objects::TabletRole;
use crate::infrastructure::health_registry::HealthRegistry;
use crate::infrastructure::shutdown::ShutdownController;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::trace::TraceLayer;

/// Status server state.
#[derive(Clone)]
pub struct StatusState {
    pub registry: HealthRegistry,
    pub metrics: Arc<DashMapGatewayMetrics>,
    pub query_log: StreamLogger,
    /// Roles that must have a serving tablet before `/healthz` reports ready
    pub ready_roles: Vec<TabletRole>,
}

/// One tablet in `/debug/health`.
#[derive(Debug, Serialize)]
pub struct TabletStatus {
    pub alias: String,
    pub target: String,
    pub addr: String,
    pub serving: bool,
    pub replication_lag_secs: f64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl From<&EndpointHealth> for TabletStatus {
    fn from(health: &EndpointHealth) -> Self {
        Self {
            alias: health.endpoint.alias().to_string(),
            target: health.endpoint.target.to_string(),
            addr: health.endpoint.addr(),
            serving: health.serving,
            replication_lag_secs: health.replication_lag.as_secs_f64(),
            consecutive_failures: health.consecutive_failures,
            last_error: health.last_error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthSetStatus {
    pub target: String,
    /// Serving tablets, lowest lag first
    pub serving: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub sets: Vec<HealthSetStatus>,
    pub tablets: Vec<TabletStatus>,
}

#[derive(Debug, Serialize)]
pub struct QueryLogVars {
    pub published: u64,
    pub dropped: u64,
    pub subscribers: usize,
}

#[derive(Debug, Serialize)]
pub struct VarsResponse {
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    pub query_log: QueryLogVars,
}

/// Build the status router.
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/debug/health", get(health_handler))
        .route("/debug/vars", get(vars_handler))
        .route("/debug/querylog", get(querylog_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Status HTTP server.
pub struct StatusServer {
    listen_addr: String,
    state: StatusState,
}

impl StatusServer {
    pub fn new(listen_addr: String, state: StatusState) -> Self {
        Self { listen_addr, state }
    }

    /// Serve until `shutdown` fires.
    pub async fn run(&self, shutdown: ShutdownController) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let listener = TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("status server listening on {}", self.listen_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.stopped().await })
            .await?;
        Ok(())
    }
}

// Handler functions

async fn healthz_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let missing = state.registry.missing_roles(&state.ready_roles);
    if missing.is_empty() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "waiting",
                "missing": missing,
            })),
        )
    }
}

async fn health_handler(State(state): State<StatusState>) -> impl IntoResponse {
    let sets = state
        .registry
        .all_sets()
        .iter()
        .map(|set| HealthSetStatus {
            target: set.target.to_string(),
            serving: set
                .endpoints
                .iter()
                .map(|e| e.endpoint.alias().to_string())
                .collect(),
        })
        .collect();

    let tablets = state
        .registry
        .endpoint_states()
        .iter()
        .map(TabletStatus::from)
        .collect();

    Json(HealthReport { sets, tablets })
}

async fn vars_handler(State(state): State<StatusState>) -> impl IntoResponse {
    Json(VarsResponse {
        metrics: state.metrics.snapshot(),
        query_log: QueryLogVars {
            published: state.query_log.published(),
            dropped: state.query_log.dropped(),
            subscribers: state.query_log.subscriber_count(),
        },
    })
}

/// Stream formatted records until the client goes away. `?full` shows
/// bind variables unredacted.
async fn querylog_handler(
    State(state): State<StatusState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let full = params.contains_key("full");
    let records = ReceiverStream::new(state.query_log.subscribe());
    let lines = records.map(move |record| Ok::<_, Infallible>(record.format(full)));

    Response::builder()
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from_stream(lines))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
