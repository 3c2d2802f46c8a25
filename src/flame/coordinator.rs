//! Flame coordinator: job submission state machine.
//!
//! Per submission: broadcast the job name to every live Flame worker
//! (best-effort — per-worker failures are collected and logged, the
//! submission proceeds on partial failure), resolve the entry point from
//! the job registry, run it with a fresh context, and return whatever the
//! job wrote to its output buffer. There is no cancellation or timeout; a
//! hung job blocks its HTTP request indefinitely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;

use crate::error::Error;
use crate::flame::context::FlameContext;
use crate::flame::jobs::JobRegistry;
use crate::flame::ops::FnRegistry;
use crate::flame::protocol::ROUTE_USE_JOB;
use crate::liveness::{registry, LivenessRegistry};

pub const VERSION: &str = "v0.1";

pub struct FlameCoordinator {
    pub liveness: Arc<LivenessRegistry>,
    pub jobs: Arc<JobRegistry>,
    pub functions: Arc<FnRegistry>,
    pub kvs_coordinator: String,
    http: reqwest::Client,
}

impl FlameCoordinator {
    pub fn new(
        kvs_coordinator: impl Into<String>,
        liveness: Arc<LivenessRegistry>,
        jobs: Arc<JobRegistry>,
        functions: Arc<FnRegistry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            liveness,
            jobs,
            functions,
            kvs_coordinator: kvs_coordinator.into(),
            http: reqwest::Client::new(),
        })
    }

    /// Tells every live worker which job is active. Best-effort: a worker
    /// that cannot be reached is logged and skipped.
    async fn broadcast_job(&self, job: &str) {
        for address in self.liveness.live_addresses() {
            let url = format!("http://{address}{ROUTE_USE_JOB}");
            let result = self
                .http
                .post(&url)
                .query(&[("job", job)])
                .timeout(Duration::from_secs(5))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {}
                Ok(resp) => {
                    tracing::warn!(
                        "job broadcast to {} returned status {}",
                        address,
                        resp.status()
                    );
                }
                Err(e) => {
                    tracing::warn!("job broadcast to {} failed: {}", address, e);
                }
            }
        }
    }
}

pub fn router(coordinator: Arc<FlameCoordinator>) -> Router {
    let liveness = coordinator.liveness.clone();
    Router::new()
        .route("/submit", post(handle_submit))
        .route("/version", get(handle_version))
        .route("/", get(handle_dashboard))
        .layer(Extension(coordinator))
        .merge(registry::router(liveness))
}

async fn handle_submit(
    Extension(coordinator): Extension<Arc<FlameCoordinator>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let Some(job_name) = params.get("class").cloned() else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing job name (parameter 'class')".to_string(),
        );
    };
    tracing::info!("New job submitted; entry point is '{}'", job_name);

    let mut args = Vec::new();
    let mut i = 1;
    while let Some(arg) = params.get(&format!("arg{i}")) {
        args.push(arg.clone());
        i += 1;
    }

    coordinator.broadcast_job(&job_name).await;

    let ctx = FlameContext::new(
        &coordinator.kvs_coordinator,
        coordinator.liveness.clone(),
        coordinator.functions.clone(),
    );

    match coordinator.jobs.run(&job_name, ctx.clone(), args).await {
        Ok(()) => (StatusCode::OK, ctx.take_output()),
        Err(Error::BadSubmission(message)) => (StatusCode::BAD_REQUEST, message),
        Err(e) => {
            tracing::error!("job '{}' failed: {}", job_name, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

async fn handle_version() -> &'static str {
    VERSION
}

async fn handle_dashboard(
    Extension(coordinator): Extension<Arc<FlameCoordinator>>,
) -> Html<String> {
    Html(format!(
        "<html><head><title>Flame coordinator</title></head><body>\
         <h3>Flame Coordinator</h3>\n{}</body></html>",
        coordinator.liveness.worker_table_html()
    ))
}
