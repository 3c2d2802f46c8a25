use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use flamekv::kvs::{handlers, ReplicationManager, TableStore};
use flamekv::liveness::spawn_ping_loop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<u16> = None;
    let mut storage: Option<String> = None;
    let mut coordinator: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                port = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--storage" => {
                storage = Some(args[i + 1].clone());
                i += 2;
            }
            "--coordinator" => {
                coordinator = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    let (Some(port), Some(storage), Some(coordinator)) = (port, storage, coordinator) else {
        eprintln!(
            "Usage: {} --port <port> --storage <dir> --coordinator <ip:port>",
            args[0]
        );
        std::process::exit(1);
    };

    let store = Arc::new(TableStore::new(storage.as_str())?);
    let worker_id = load_or_create_worker_id(store.storage_dir())?;
    tracing::info!(
        "KVS worker '{}' starting on port {}, storage '{}', coordinator {}",
        worker_id,
        port,
        storage,
        coordinator
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_ping_loop(coordinator.clone(), worker_id.clone(), port, shutdown_rx.clone());

    let replication = ReplicationManager::new(coordinator, worker_id, store.clone());
    replication.start(shutdown_rx);

    let app = handlers::router(store, replication);
    let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;

    shutdown_tx.send(true).ok();
    tracing::info!("KVS worker shut down");
    Ok(())
}

/// The worker identity is persisted next to its data so it keeps its ring
/// position across restarts.
fn load_or_create_worker_id(storage_dir: &Path) -> anyhow::Result<String> {
    let id_file = storage_dir.join("id");
    if let Ok(existing) = std::fs::read_to_string(&id_file) {
        let existing = existing.trim().to_string();
        if !existing.is_empty() {
            return Ok(existing);
        }
    }
    let mut rng = rand::thread_rng();
    let id: String = (0..5)
        .map(|_| (b'a' + rng.gen_range(0..26)) as char)
        .collect();
    std::fs::write(&id_file, format!("{id}\n"))?;
    Ok(id)
}
