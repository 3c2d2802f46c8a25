use std::net::SocketAddr;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use flamekv::flame::ops::register_builtins;
use flamekv::flame::worker::{router, FlameWorker};
use flamekv::flame::FnRegistry;
use flamekv::liveness::spawn_ping_loop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<u16> = None;
    let mut coordinator: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                port = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--coordinator" => {
                coordinator = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    let (Some(port), Some(coordinator)) = (port, coordinator) else {
        eprintln!("Usage: {} --port <port> --coordinator <ip:port>", args[0]);
        std::process::exit(1);
    };

    let functions = FnRegistry::new();
    register_builtins(&functions);
    let worker = FlameWorker::new(functions);

    // Flame workers identify themselves by port, like the coordinator
    // expects when building dispatch URLs from the liveness registry.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_ping_loop(coordinator.clone(), port.to_string(), port, shutdown_rx);

    let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!(
        "Flame worker listening on {}, coordinator {}",
        bind_addr,
        coordinator
    );

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        router(worker).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        tokio::signal::ctrl_c().await.ok();
    })
    .await?;

    shutdown_tx.send(true).ok();
    Ok(())
}
