use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use flamekv::flame::coordinator::{router, FlameCoordinator};
use flamekv::flame::ops::register_builtins;
use flamekv::flame::{FlameContext, FnRegistry, JobRegistry};
use flamekv::liveness::LivenessRegistry;
use flamekv::Result;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut port: Option<u16> = None;
    let mut kvs_coordinator: Option<String> = None;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                port = Some(args[i + 1].parse()?);
                i += 2;
            }
            "--kvs" => {
                kvs_coordinator = Some(args[i + 1].clone());
                i += 2;
            }
            _ => i += 1,
        }
    }
    let (Some(port), Some(kvs_coordinator)) = (port, kvs_coordinator) else {
        eprintln!("Usage: {} --port <port> --kvs <kvsCoordinator>", args[0]);
        std::process::exit(1);
    };

    let liveness = Arc::new(LivenessRegistry::new());
    let functions = FnRegistry::new();
    register_builtins(&functions);
    let jobs = JobRegistry::new();
    register_jobs(&jobs);

    let coordinator = FlameCoordinator::new(kvs_coordinator, liveness, jobs, functions);

    let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!("Flame coordinator listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(
        listener,
        router(coordinator).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Jobs shipped with the coordinator. Submissions name one of these via the
/// `class` parameter.
fn register_jobs(jobs: &JobRegistry) {
    jobs.register("word-count", |ctx: FlameContext, args: Vec<String>| async move {
        word_count(ctx, args).await
    });
    jobs.register(
        "distinct-count",
        |ctx: FlameContext, args: Vec<String>| async move {
            let distinct = ctx.parallelize(&args).await?.distinct().await?;
            let count = distinct.count().await?;
            ctx.output(&format!("{count}\n"));
            Ok(())
        },
    );
}

async fn word_count(ctx: FlameContext, args: Vec<String>) -> Result<()> {
    let counted = ctx
        .parallelize(&args)
        .await?
        .flat_map("split-whitespace")
        .await?
        .map_to_pair("word-one")
        .await?
        .fold_by_key("0", "sum")
        .await?;
    let mut pairs = counted.collect().await?;
    pairs.sort();
    for (word, count) in pairs {
        ctx.output(&format!("{word} {count}\n"));
    }
    Ok(())
}
