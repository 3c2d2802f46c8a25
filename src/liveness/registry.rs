//! TTL-based heartbeat registry shared by both coordinators.
//!
//! Workers call `GET /ping?id=&port=` every few seconds; the registry takes
//! the peer IP from the socket and drops any registration that has not been
//! refreshed within the TTL. `GET /workers` answers with a count line
//! followed by one `id,ip:port` line per live worker.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Extension, Query};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tokio::sync::watch;

use super::types::{PingParams, WorkerInfo};

pub const WORKER_TTL: Duration = Duration::from_secs(15);
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

struct Registration {
    info: WorkerInfo,
    last_ping: Instant,
}

pub struct LivenessRegistry {
    workers: DashMap<String, Registration>,
    ttl: Duration,
}

impl Default for LivenessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessRegistry {
    pub fn new() -> Self {
        Self::with_ttl(WORKER_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            ttl,
        }
    }

    /// Registers a worker or refreshes its heartbeat.
    pub fn record_ping(&self, id: &str, ip: IpAddr, port: u16) {
        let info = WorkerInfo {
            id: id.to_string(),
            address: format!("{ip}:{port}"),
        };
        self.workers.insert(
            id.to_string(),
            Registration {
                info,
                last_ping: Instant::now(),
            },
        );
    }

    fn prune(&self) {
        let ttl = self.ttl;
        self.workers
            .retain(|_, reg| reg.last_ping.elapsed() <= ttl);
    }

    /// Live workers, sorted by ID (the ring order).
    pub fn live_workers(&self) -> Vec<WorkerInfo> {
        self.prune();
        let mut workers: Vec<WorkerInfo> =
            self.workers.iter().map(|e| e.value().info.clone()).collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    pub fn live_addresses(&self) -> Vec<String> {
        self.live_workers()
            .into_iter()
            .map(|w| w.address)
            .collect()
    }

    /// The `/workers` response body: `N\n` then `N` lines of `id,ip:port`.
    pub fn workers_response(&self) -> String {
        let workers = self.live_workers();
        let mut out = format!("{}\n", workers.len());
        for worker in workers {
            out.push_str(&format!("{},{}\n", worker.id, worker.address));
        }
        out
    }

    /// HTML table of live workers for the coordinator dashboards.
    pub fn worker_table_html(&self) -> String {
        let mut html =
            String::from("<table border='1'><tr><th>ID</th><th>Address</th></tr>");
        for worker in self.live_workers() {
            html.push_str(&format!(
                "<tr><td><a href='http://{}/'>{}</a></td><td>{}</td></tr>",
                worker.address, worker.id, worker.address
            ));
        }
        html.push_str("</table>");
        html
    }
}

/// Routes shared by both coordinators.
pub fn router(registry: Arc<LivenessRegistry>) -> Router {
    Router::new()
        .route("/ping", get(handle_ping))
        .route("/workers", get(handle_workers))
        .layer(Extension(registry))
}

async fn handle_ping(
    Extension(registry): Extension<Arc<LivenessRegistry>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<PingParams>,
) -> (StatusCode, String) {
    let (Some(id), Some(port)) = (params.id, params.port) else {
        return (
            StatusCode::BAD_REQUEST,
            "Missing id or port parameter".to_string(),
        );
    };
    let Ok(port) = port.parse::<u16>() else {
        return (StatusCode::BAD_REQUEST, "Invalid port number".to_string());
    };
    registry.record_ping(&id, peer.ip(), port);
    (StatusCode::OK, "OK".to_string())
}

async fn handle_workers(
    Extension(registry): Extension<Arc<LivenessRegistry>>,
) -> String {
    registry.workers_response()
}

/// Worker-side heartbeat loop: registers with the coordinator every
/// [`PING_INTERVAL`] until the shutdown channel flips. Errors are logged and
/// retried on the next tick.
pub fn spawn_ping_loop(
    coordinator: String,
    id: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let http = reqwest::Client::new();
        let url = format!("http://{coordinator}/ping");
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let result = http
                        .get(&url)
                        .query(&[("id", id.clone()), ("port", port.to_string())])
                        .timeout(Duration::from_secs(2))
                        .send()
                        .await;
                    if let Err(e) = result {
                        tracing::warn!("ping to {} failed: {}", coordinator, e);
                    }
                }
                _ = shutdown.changed() => {
                    tracing::info!("ping loop shutting down");
                    return;
                }
            }
        }
    });
}
