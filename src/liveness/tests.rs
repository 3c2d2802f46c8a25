//! Liveness Registry Tests
//!
//! Registration, TTL expiry, and the text protocol served to clients.
//! The HTTP surface is exercised against a real listener because `/ping`
//! reads the peer IP from the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::liveness::registry::{router, LivenessRegistry};

async fn spawn_registry_server(registry: Arc<LivenessRegistry>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(registry);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

#[tokio::test]
async fn test_record_and_list_workers() {
    let registry = LivenessRegistry::new();
    registry.record_ping("aaaaa", "127.0.0.1".parse().unwrap(), 9001);
    registry.record_ping("bbbbb", "127.0.0.1".parse().unwrap(), 9002);

    let workers = registry.live_workers();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].id, "aaaaa");
    assert_eq!(workers[1].address, "127.0.0.1:9002");
}

#[tokio::test]
async fn test_workers_response_format() {
    let registry = LivenessRegistry::new();
    registry.record_ping("wwwww", "10.0.0.5".parse().unwrap(), 8000);

    let body = registry.workers_response();
    assert_eq!(body, "1\nwwwww,10.0.0.5:8000\n");
}

#[tokio::test]
async fn test_expired_registration_is_pruned() {
    let registry = LivenessRegistry::with_ttl(Duration::from_millis(50));
    registry.record_ping("short", "127.0.0.1".parse().unwrap(), 9001);
    assert_eq!(registry.live_workers().len(), 1);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(registry.live_workers().is_empty());
    assert_eq!(registry.workers_response(), "0\n");
}

#[tokio::test]
async fn test_ping_refreshes_registration() {
    let registry = LivenessRegistry::with_ttl(Duration::from_millis(200));
    registry.record_ping("alive", "127.0.0.1".parse().unwrap(), 9001);

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.record_ping("alive", "127.0.0.1".parse().unwrap(), 9001);
    }
    assert_eq!(registry.live_workers().len(), 1);
}

#[tokio::test]
async fn test_ping_endpoint_registers_peer_ip() {
    let registry = Arc::new(LivenessRegistry::new());
    let addr = spawn_registry_server(registry.clone()).await;

    let http = reqwest::Client::new();
    let resp = http
        .get(format!("http://{addr}/ping"))
        .query(&[("id", "node1"), ("port", "7700")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");

    let workers = registry.live_workers();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].id, "node1");
    assert_eq!(workers[0].address, "127.0.0.1:7700");

    let listing = http
        .get(format!("http://{addr}/workers"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(listing, "1\nnode1,127.0.0.1:7700\n");
}

#[tokio::test]
async fn test_ping_endpoint_rejects_missing_params() {
    let registry = Arc::new(LivenessRegistry::new());
    let addr = spawn_registry_server(registry).await;

    let http = reqwest::Client::new();
    let resp = http
        .get(format!("http://{addr}/ping"))
        .query(&[("id", "lonely")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let resp = http
        .get(format!("http://{addr}/ping"))
        .query(&[("id", "badport"), ("port", "not-a-number")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}
