use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Extension;
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tracing_subscriber::EnvFilter;

use flamekv::liveness::{registry, LivenessRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<u16> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                port = Some(args[i + 1].parse()?);
                i += 2;
            }
            _ => i += 1,
        }
    }
    let Some(port) = port else {
        eprintln!("Usage: {} --port <port>", args[0]);
        std::process::exit(1);
    };

    let liveness = Arc::new(LivenessRegistry::new());

    let app = Router::new()
        .route("/", get(handle_dashboard))
        .layer(Extension(liveness.clone()))
        .merge(registry::router(liveness));

    let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!("KVS coordinator listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn handle_dashboard(
    Extension(liveness): Extension<Arc<LivenessRegistry>>,
) -> Html<String> {
    Html(format!(
        "<!DOCTYPE html><html><head><title>KVS Coordinator</title></head><body>\
         <h1>KVS Coordinator</h1>{}</body></html>",
        liveness.worker_table_html()
    ))
}
