//! KVS Module Tests
//!
//! Storage mechanics are tested directly against `TableStore`; the routing
//! client, conditional writes, fan-out aggregation, and scans are exercised
//! against real workers listening on ephemeral ports, registered with a
//! real coordinator so the client's ring download is the genuine article.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Error;
use crate::kvs::client::{route_index, KvsClient, WorkerEntry};
use crate::kvs::handlers;
use crate::kvs::replication::ReplicationManager;
use crate::kvs::row::Row;
use crate::kvs::store::{encode_key, TableStore};
use crate::liveness::registry::{self, LivenessRegistry};

async fn spawn(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
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

struct TestCluster {
    coordinator: SocketAddr,
    stores: Vec<Arc<TableStore>>,
    #[allow(dead_code)]
    dirs: Vec<tempfile::TempDir>,
}

/// One coordinator plus one worker per given ID, all on ephemeral ports.
async fn cluster(ids: &[&str]) -> TestCluster {
    let liveness = Arc::new(LivenessRegistry::new());
    let coordinator = spawn(registry::router(liveness.clone())).await;

    let mut stores = Vec::new();
    let mut dirs = Vec::new();
    for id in ids {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TableStore::new(dir.path()).unwrap());
        let replication = ReplicationManager::new(coordinator.to_string(), *id, store.clone());
        let addr = spawn(handlers::router(store.clone(), replication)).await;
        liveness.record_ping(id, addr.ip(), addr.port());
        stores.push(store);
        dirs.push(dir);
    }

    TestCluster {
        coordinator,
        stores,
        dirs,
    }
}

fn value_row(key: &str, value: &str) -> Row {
    let mut row = Row::new(key);
    row.set("value", value.as_bytes());
    row
}

// ============================================================
// TABLE STORE
// ============================================================

#[tokio::test]
async fn test_store_versioned_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path()).unwrap();

    let v1 = store.put_cell("t", "r", "c", b"one".to_vec()).unwrap();
    let v2 = store.put_cell("t", "r", "c", b"two".to_vec()).unwrap();
    assert_eq!((v1, v2), (1, 2));
    assert_eq!(store.current_version("t", "r"), 2);

    let current = store.get_row("t", "r").unwrap().unwrap();
    assert_eq!(current.get("c"), Some("two"));

    let old = store.get_row_version("t", "r", 1).unwrap();
    assert_eq!(old.get("c"), Some("one"));
    assert!(store.get_row_version("t", "r", 3).is_none());
}

#[tokio::test]
async fn test_store_persistent_rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = TableStore::new(dir.path()).unwrap();
        store
            .put_row("pt-pages", value_row("some-long-row-key", "hello"))
            .unwrap();
        store.put_row("pt-pages", value_row("k", "short")).unwrap();
    }
    let reopened = TableStore::new(dir.path()).unwrap();
    let row = reopened
        .get_row("pt-pages", "some-long-row-key")
        .unwrap()
        .unwrap();
    assert_eq!(row.get("value"), Some("hello"));
    assert_eq!(reopened.count("pt-pages"), 2);

    // Long keys are bucketed under a two-character prefix directory.
    let encoded = encode_key("some-long-row-key");
    let bucketed = dir
        .path()
        .join("pt-pages")
        .join(format!("_{}", &encoded[..2]))
        .join(&encoded);
    assert!(bucketed.is_file());
}

#[tokio::test]
async fn test_store_scan_is_sorted_and_range_filtered() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path()).unwrap();
    for key in ["delta", "alpha", "echo", "bravo", "charlie"] {
        store.put_row("t", value_row(key, key)).unwrap();
    }

    let all: Vec<String> = store
        .scan("t", None, None)
        .unwrap()
        .iter()
        .map(|r| r.key().to_string())
        .collect();
    assert_eq!(all, vec!["alpha", "bravo", "charlie", "delta", "echo"]);

    let range: Vec<String> = store
        .scan("t", Some("bravo"), Some("delta"))
        .unwrap()
        .iter()
        .map(|r| r.key().to_string())
        .collect();
    assert_eq!(range, vec!["bravo", "charlie"]);
}

#[tokio::test]
async fn test_store_delete_and_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path()).unwrap();
    store.put_row("t", value_row("r", "v")).unwrap();

    store.delete_row("t", "r").unwrap();
    assert!(store.get_row("t", "r").unwrap().is_none());
    assert!(matches!(
        store.delete_row("t", "r"),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        store.delete_table("missing"),
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn test_store_rename_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path()).unwrap();
    store.put_row("old", value_row("r", "v")).unwrap();
    store.put_row("taken", value_row("r", "v")).unwrap();

    assert!(matches!(
        store.rename_table("old", "taken"),
        Err(Error::Conflict(_))
    ));
    assert!(matches!(
        store.rename_table("ghost", "fresh"),
        Err(Error::NotFound(_))
    ));

    store.rename_table("old", "new").unwrap();
    assert!(store.get_row("old", "r").unwrap().is_none());
    assert_eq!(
        store.get_row("new", "r").unwrap().unwrap().get("value"),
        Some("v")
    );
}

#[tokio::test]
async fn test_store_rename_rejects_class_change() {
    let dir = tempfile::tempdir().unwrap();
    let store = TableStore::new(dir.path()).unwrap();
    store.put_row("pt-data", value_row("r", "v")).unwrap();
    store.put_row("scratch", value_row("r", "v")).unwrap();

    assert!(matches!(
        store.rename_table("pt-data", "data"),
        Err(Error::BadRequest(_))
    ));
    assert!(matches!(
        store.rename_table("scratch", "pt-scratch"),
        Err(Error::BadRequest(_))
    ));
    // Neither table was altered.
    assert_eq!(store.count("pt-data"), 1);
    assert_eq!(store.count("scratch"), 1);
}

// ============================================================
// ROUTING
// ============================================================

#[test]
fn test_route_index_picks_greatest_id_at_or_below_key() {
    let workers: Vec<WorkerEntry> = ["ccccc", "ggggg", "ppppp"]
        .iter()
        .map(|id| WorkerEntry {
            id: id.to_string(),
            address: String::new(),
        })
        .collect();

    assert_eq!(route_index(&workers, "dog"), 0); // ccccc <= dog < ggggg
    assert_eq!(route_index(&workers, "horse"), 1);
    assert_eq!(route_index(&workers, "zebra"), 2); // above max -> last
    assert_eq!(route_index(&workers, "ant"), 2); // below min wraps to last
    assert_eq!(route_index(&workers, "ccccc"), 0); // boundary is inclusive
}

// ============================================================
// CLIENT AGAINST REAL WORKERS
// ============================================================

#[tokio::test]
async fn test_client_put_get_roundtrip() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    client.put("t", "horse", "value", "neigh").await.unwrap();
    let fetched = client.get("t", "horse", "value").await.unwrap().unwrap();
    assert_eq!(fetched, b"neigh");

    let row = client.get_row("t", "horse").await.unwrap().unwrap();
    assert_eq!(row.get("value"), Some("neigh"));
    assert!(client.get_row("t", "missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_client_falls_back_to_other_workers_on_miss() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    // "horse" routes to worker ggggg; plant the row only on ppppp to
    // simulate a stale ring cache after a membership change.
    cluster.stores[1]
        .put_row("t", value_row("horse", "misplaced"))
        .unwrap();

    let fetched = client.get("t", "horse", "value").await.unwrap().unwrap();
    assert_eq!(fetched, b"misplaced");
}

#[tokio::test]
async fn test_client_conditional_put() {
    let cluster = cluster(&["mmmmm"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    client.put("jobs", "job-1", "status", "done").await.unwrap();

    // Condition does not hold: the write must be rejected and the row left
    // unmodified.
    let accepted = client
        .put_if("jobs", "job-1", "status", "running", "status", "pending")
        .await
        .unwrap();
    assert!(!accepted);
    let row = client.get_row("jobs", "job-1").await.unwrap().unwrap();
    assert_eq!(row.get("status"), Some("done"));
    assert_eq!(row.column_count(), 1);

    // Condition holds: the write goes through.
    let accepted = client
        .put_if("jobs", "job-1", "status", "archived", "status", "done")
        .await
        .unwrap();
    assert!(accepted);
    let row = client.get_row("jobs", "job-1").await.unwrap().unwrap();
    assert_eq!(row.get("status"), Some("archived"));
}

#[tokio::test]
async fn test_client_count_sums_across_workers() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    for key in ["ant", "horse", "zebra", "goat"] {
        client.put("t", key, "value", key).await.unwrap();
    }
    assert_eq!(client.count("t").await.unwrap(), 4);
    // Rows landed on both sides of the ring.
    assert!(cluster.stores[0].count("t") >= 1);
    assert!(cluster.stores[1].count("t") >= 1);
}

#[tokio::test]
async fn test_client_scan_streams_in_key_order() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    let keys = ["ant", "goat", "horse", "pig", "zebra"];
    for key in keys {
        client.put("t", key, "value", key).await.unwrap();
    }

    let mut scan = client.scan("t", None, None).await.unwrap();
    let mut seen = Vec::new();
    while let Some(row) = scan.next_row().await.unwrap() {
        seen.push(row.key().to_string());
    }
    seen.sort();
    assert_eq!(seen, keys.iter().map(|k| k.to_string()).collect::<Vec<_>>());

    // Bounded range: [goat, pig)
    let rows = client
        .scan("t", Some("goat"), Some("pig"))
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    let mut keys: Vec<_> = rows.iter().map(|r| r.key().to_string()).collect();
    keys.sort();
    assert_eq!(keys, vec!["goat", "horse"]);
}

#[tokio::test]
async fn test_client_scan_skips_workers_without_the_table() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    // Table exists only on the second worker.
    cluster.stores[1].put_row("solo", value_row("k", "v")).unwrap();

    let rows = client
        .scan("solo", None, None)
        .await
        .unwrap()
        .collect_rows()
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key(), "k");
}

#[tokio::test]
async fn test_client_rename_fans_out_and_rejects_class_change() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    // One key per ring side so every worker holds the table.
    client.put("t", "ant", "value", "1").await.unwrap();
    client.put("t", "horse", "value", "2").await.unwrap();

    assert!(client.rename("t", "renamed").await.unwrap());
    assert_eq!(client.count("renamed").await.unwrap(), 2);
    assert_eq!(client.count("t").await.unwrap(), 0);

    // Persistence-class mismatch is refused by every worker with a 400 and
    // leaves both names untouched.
    assert!(!client.rename("renamed", "pt-renamed").await.unwrap());
    assert_eq!(client.count("renamed").await.unwrap(), 2);

    let workers = client.workers().await.unwrap();
    let resp = reqwest::Client::new()
        .put(format!("http://{}/rename/renamed", workers[0].address))
        .body("pt-renamed")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
    assert_eq!(client.count("pt-renamed").await.unwrap(), 0);
}

#[tokio::test]
async fn test_client_delete_table() {
    let cluster = cluster(&["ggggg", "ppppp"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    client.put("t", "ant", "value", "1").await.unwrap();
    client.delete_table("t").await.unwrap();
    assert_eq!(client.count("t").await.unwrap(), 0);
    let _ = cluster;
}

#[tokio::test]
async fn test_versioned_cell_read() {
    let cluster = cluster(&["mmmmm"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    client.put("t", "r", "c", "one").await.unwrap();
    client.put("t", "r", "c", "two").await.unwrap();

    let workers = client.workers().await.unwrap();
    let http = reqwest::Client::new();
    let resp = http
        .get(format!("http://{}/data/t/r/c", workers[0].address))
        .query(&[("version", "1")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.headers().get("Version").unwrap(), "1");
    assert_eq!(resp.text().await.unwrap(), "one");

    let latest = http
        .get(format!("http://{}/data/t/r/c", workers[0].address))
        .send()
        .await
        .unwrap();
    assert_eq!(latest.headers().get("Version").unwrap(), "2");
}

// ============================================================
// APPEND-CAPPED POSTING LISTS
// ============================================================

async fn read_str(client: &KvsClient, column: &str) -> Option<String> {
    client
        .get("index", "word", column)
        .await
        .unwrap()
        .map(|b| String::from_utf8(b).unwrap())
}

#[tokio::test]
async fn test_append_capped_chunks_and_full_marker() {
    let cluster = cluster(&["mmmmm"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    for doc in ["d1", "d2", "d3", "d4", "d5"] {
        client
            .append_capped("index", "word", "index", doc, 5, ',', 2, 0)
            .await
            .unwrap();
    }

    assert_eq!(read_str(&client, "index0000").await.as_deref(), Some("d1,d2"));
    assert_eq!(read_str(&client, "index0001").await.as_deref(), Some("d3,d4"));
    assert_eq!(read_str(&client, "index0002").await.as_deref(), Some("d5"));
    assert_eq!(read_str(&client, "__count").await.as_deref(), Some("5"));
    assert_eq!(read_str(&client, "__full").await.as_deref(), Some("1"));

    // A sixth append is a no-op.
    client
        .append_capped("index", "word", "index", "d6", 5, ',', 2, 0)
        .await
        .unwrap();
    assert_eq!(read_str(&client, "__count").await.as_deref(), Some("5"));
    assert_eq!(read_str(&client, "index0002").await.as_deref(), Some("d5"));
}

#[tokio::test]
async fn test_append_capped_deduplicates() {
    let cluster = cluster(&["mmmmm"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    client
        .append_capped("index", "word", "docs", "doc-1", 10, ',', 5, 0)
        .await
        .unwrap();
    client
        .append_capped("index", "word", "docs", "doc-1", 10, ',', 5, 0)
        .await
        .unwrap();

    let chunk = client.get("index", "word", "docs0000").await.unwrap().unwrap();
    assert_eq!(String::from_utf8(chunk).unwrap(), "doc-1");
    let count = client.get("index", "word", "__count").await.unwrap().unwrap();
    assert_eq!(String::from_utf8(count).unwrap(), "1");
}

#[tokio::test]
async fn test_append_capped_doc_frequency_cap() {
    let cluster = cluster(&["mmmmm"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());

    // Effective cap is min(maxItems, maxDocFrequency) = 2.
    for doc in ["a", "b", "c"] {
        client
            .append_capped("index", "word", "docs", doc, 10, ',', 5, 2)
            .await
            .unwrap();
    }
    let count = client.get("index", "word", "__count").await.unwrap().unwrap();
    assert_eq!(String::from_utf8(count).unwrap(), "2");
    let full = client.get("index", "word", "__full").await.unwrap().unwrap();
    assert_eq!(String::from_utf8(full).unwrap(), "1");
}

// ============================================================
// REPLICATION
// ============================================================

#[tokio::test]
async fn test_anti_entropy_fills_missing_rows() {
    let cluster = cluster(&["aaaaa", "bbbbb"]).await;
    let client = KvsClient::new(cluster.coordinator.to_string());
    let workers = client.workers().await.unwrap();

    // Worker bbbbb holds a row that aaaaa is missing.
    cluster.stores[1]
        .put_row("t", value_row("orphan", "rescued"))
        .unwrap();

    let manager = ReplicationManager::new(
        cluster.coordinator.to_string(),
        "aaaaa",
        cluster.stores[0].clone(),
    );
    manager
        .set_peers_for_test(
            workers
                .iter()
                .map(|w| (w.id.clone(), w.address.clone()))
                .collect(),
        )
        .await;
    manager.sync_once().await;

    let repaired = cluster.stores[0].get_row("t", "orphan").unwrap().unwrap();
    assert_eq!(repaired.get("value"), Some("rescued"));
}

#[tokio::test]
async fn test_hash_row_tracks_content() {
    use crate::kvs::replication::hash_row;

    let a = value_row("k", "v1");
    let b = value_row("k", "v2");
    assert_ne!(hash_row(&a), hash_row(&b));
    assert_eq!(hash_row(&a), hash_row(&a.clone()));
}
