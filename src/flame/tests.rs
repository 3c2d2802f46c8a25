//! Flame Module Tests
//!
//! Partition-plan properties are checked directly; operator and dispatch
//! behavior runs against a miniature live cluster (KVS coordinator, two KVS
//! workers, one Flame worker) on ephemeral ports.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::Error;
use crate::flame::context::FlameContext;
use crate::flame::coordinator::{self, FlameCoordinator};
use crate::flame::jobs::JobRegistry;
use crate::flame::ops::{register_builtins, FnRegistry};
use crate::flame::partitioner::{Partition, Partitioner};
use crate::flame::rdd::PairRdd;
use crate::flame::worker::{self, FlameWorker};
use crate::kvs::client::{route_index, KvsClient, WorkerEntry};
use crate::kvs::handlers as kvs_handlers;
use crate::kvs::replication::ReplicationManager;
use crate::kvs::store::TableStore;
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

fn entries(ids: &[&str]) -> Vec<WorkerEntry> {
    ids.iter()
        .map(|id| WorkerEntry {
            id: id.to_string(),
            address: format!("kvs-{id}:9000"),
        })
        .collect()
}

/// Asserts the partitions tile the whole key space exactly once.
fn assert_tiling(partitions: &[Partition]) {
    let mut ranges: Vec<(Option<&str>, Option<&str>)> = partitions
        .iter()
        .map(|p| (p.from_key.as_deref(), p.to_key_exclusive.as_deref()))
        .collect();
    // Order ranges: the wraparound (unbounded low) first, then by from key.
    ranges.sort_by(|a, b| match (a.0, b.0) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y),
    });

    assert!(ranges[0].0.is_none(), "lowest range must be unbounded below");
    assert!(
        ranges.last().unwrap().1.is_none(),
        "highest range must be unbounded above"
    );
    for window in ranges.windows(2) {
        assert_eq!(
            window[0].1, window[1].0,
            "adjacent ranges must share a boundary (no gap, no overlap)"
        );
    }
}

// ============================================================
// PARTITIONER
// ============================================================

#[test]
fn test_partitions_tile_key_space() {
    for kvs_count in 1..=5 {
        for flame_count in 1..=3 {
            let ids: Vec<String> = (0..kvs_count).map(|i| format!("w{i:02}")).collect();
            let id_refs: Vec<&str> = ids.iter().map(|s| s.as_str()).collect();
            let flame: Vec<String> = (0..flame_count)
                .map(|i| format!("flame-{i}:9100"))
                .collect();

            let partitions = Partitioner::from_ring(&entries(&id_refs), &flame)
                .assign()
                .unwrap();
            assert_eq!(partitions.len(), kvs_count + 1);
            assert_tiling(&partitions);
        }
    }
}

#[test]
fn test_partitioner_rejects_empty_worker_sets() {
    let no_kvs = Partitioner::from_ring(&[], &["flame-0:9100".to_string()]);
    assert!(matches!(no_kvs.assign(), Err(Error::BadRequest(_))));

    let no_flame = Partitioner::from_ring(&entries(&["aaaaa"]), &[]);
    assert!(matches!(no_flame.assign(), Err(Error::BadRequest(_))));
}

#[test]
fn test_assignment_is_deterministic_round_robin() {
    let kvs = entries(&["aaaaa", "mmmmm", "zzzzz"]);
    // Deliberately unsorted worker list; assignment sorts it first.
    let flame = vec!["flame-b:9100".to_string(), "flame-a:9100".to_string()];

    let first = Partitioner::from_ring(&kvs, &flame).assign().unwrap();
    let second = Partitioner::from_ring(&kvs, &flame).assign().unwrap();
    assert_eq!(first, second);

    let assigned: Vec<&str> = first.iter().map(|p| p.flame_worker.as_str()).collect();
    assert_eq!(
        assigned,
        vec!["flame-a:9100", "flame-b:9100", "flame-a:9100", "flame-b:9100"]
    );
}

#[test]
fn test_routing_matches_partition_plan() {
    let workers = entries(&["ccccc", "ggggg", "ppppp"]);
    let flame = vec!["flame-0:9100".to_string()];
    let partitions = Partitioner::from_ring(&workers, &flame).assign().unwrap();

    for key in ["ant", "ccccc", "dog", "goat", "horse", "pig", "zebra"] {
        let routed = &workers[route_index(&workers, key)].address;
        let containing: Vec<&Partition> = partitions
            .iter()
            .filter(|p| {
                p.from_key.as_deref().map_or(true, |from| key >= from)
                    && p.to_key_exclusive.as_deref().map_or(true, |to| key < to)
            })
            .collect();
        assert_eq!(containing.len(), 1, "key '{key}' must land in exactly one range");
        assert_eq!(
            &containing[0].kvs_worker, routed,
            "partition owner and client routing disagree for key '{key}'"
        );
    }
}

// ============================================================
// REGISTRIES
// ============================================================

#[test]
fn test_fn_registry_resolves_builtins() {
    let functions = FnRegistry::new();
    register_builtins(&functions);

    let split = functions.flat_map("split-whitespace").unwrap();
    assert_eq!(split("hello flame"), vec!["hello", "flame"]);

    let sum = functions.combine("sum").unwrap();
    assert_eq!(sum("3", "4"), "7");

    assert!(matches!(
        functions.flat_map("no-such-fn"),
        Err(Error::BadSubmission(_))
    ));
    // A name registered for one operator kind does not leak into another.
    assert!(matches!(
        functions.predicate("split-whitespace"),
        Err(Error::BadSubmission(_))
    ));
}

#[tokio::test]
async fn test_job_registry_rejects_unknown_job() {
    let jobs = JobRegistry::new();
    let functions = FnRegistry::new();
    let liveness = Arc::new(LivenessRegistry::new());
    let ctx = FlameContext::new("127.0.0.1:1", liveness, functions);

    let err = jobs.run("ghost", ctx, vec![]).await.unwrap_err();
    assert!(matches!(err, Error::BadSubmission(_)));
}

// ============================================================
// MINI CLUSTER
// ============================================================

struct MiniCluster {
    kvs_coordinator: SocketAddr,
    flame_liveness: Arc<LivenessRegistry>,
    functions: Arc<FnRegistry>,
    #[allow(dead_code)]
    dirs: Vec<tempfile::TempDir>,
}

impl MiniCluster {
    async fn start(kvs_ids: &[&str]) -> Self {
        let kvs_liveness = Arc::new(LivenessRegistry::new());
        let kvs_coordinator = spawn(registry::router(kvs_liveness.clone())).await;

        let mut dirs = Vec::new();
        for id in kvs_ids {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(TableStore::new(dir.path()).unwrap());
            let replication =
                ReplicationManager::new(kvs_coordinator.to_string(), *id, store.clone());
            let addr = spawn(kvs_handlers::router(store, replication)).await;
            kvs_liveness.record_ping(id, addr.ip(), addr.port());
            dirs.push(dir);
        }

        let functions = FnRegistry::new();
        register_builtins(&functions);

        let flame_liveness = Arc::new(LivenessRegistry::new());
        let flame_worker = FlameWorker::new(functions.clone());
        let flame_addr = spawn(worker::router(flame_worker)).await;
        flame_liveness.record_ping("flame-1", flame_addr.ip(), flame_addr.port());

        Self {
            kvs_coordinator,
            flame_liveness,
            functions,
            dirs,
        }
    }

    fn context(&self) -> FlameContext {
        FlameContext::new(
            &self.kvs_coordinator.to_string(),
            self.flame_liveness.clone(),
            self.functions.clone(),
        )
    }
}

#[tokio::test]
async fn test_parallelize_count_and_collect() {
    let cluster = MiniCluster::start(&["ggggg", "ppppp"]).await;
    let ctx = cluster.context();

    let rdd = ctx
        .parallelize(&["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .unwrap();
    assert_eq!(rdd.count().await.unwrap(), 3);

    let mut values = rdd.collect().await.unwrap();
    values.sort();
    assert_eq!(values, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_distinct_collapses_duplicates() {
    let cluster = MiniCluster::start(&["ggggg", "ppppp"]).await;
    let ctx = cluster.context();

    let rdd = ctx
        .parallelize(&[
            "apple".to_string(),
            "banana".to_string(),
            "apple".to_string(),
            "cherry".to_string(),
        ])
        .await
        .unwrap();

    let distinct = rdd.distinct().await.unwrap();
    assert_eq!(distinct.count().await.unwrap(), 3);

    let mut values = distinct.collect().await.unwrap();
    values.sort();
    assert_eq!(values, vec!["apple", "banana", "cherry"]);
}

#[tokio::test]
async fn test_flat_map_and_filter() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;
    let ctx = cluster.context();

    let rdd = ctx
        .parallelize(&["hello world".to_string(), "  ".to_string()])
        .await
        .unwrap();

    let words = rdd.flat_map("split-whitespace").await.unwrap();
    assert_eq!(words.count().await.unwrap(), 2);

    let kept = rdd.filter("non-empty").await.unwrap();
    let values = kept.collect().await.unwrap();
    assert_eq!(values, vec!["hello world"]);
}

#[tokio::test]
async fn test_word_count_pipeline() {
    let cluster = MiniCluster::start(&["ggggg", "ppppp"]).await;
    let ctx = cluster.context();

    let lines = ctx
        .parallelize(&["hello world".to_string(), "hello flame".to_string()])
        .await
        .unwrap();
    let counted = lines
        .flat_map("split-whitespace")
        .await
        .unwrap()
        .map_to_pair("word-one")
        .await
        .unwrap()
        .fold_by_key("0", "sum")
        .await
        .unwrap();

    let mut pairs = counted.collect().await.unwrap();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("flame".to_string(), "1".to_string()),
            ("hello".to_string(), "2".to_string()),
            ("world".to_string(), "1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_fold_combines_partials_with_zero_element() {
    let cluster = MiniCluster::start(&["ggggg", "ppppp"]).await;
    let ctx = cluster.context();

    let rdd = ctx
        .parallelize(&["1".to_string(), "2".to_string(), "3".to_string()])
        .await
        .unwrap();
    assert_eq!(rdd.fold("0", "sum").await.unwrap(), "6");
}

#[tokio::test]
async fn test_intersection() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;
    let ctx = cluster.context();

    let left = ctx
        .parallelize(&["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .unwrap();
    let right = ctx
        .parallelize(&["b".to_string(), "c".to_string(), "d".to_string()])
        .await
        .unwrap();

    let common = left.intersection(&right).await.unwrap();
    let mut values = common.collect().await.unwrap();
    values.sort();
    assert_eq!(values, vec!["b", "c"]);
}

#[tokio::test]
async fn test_pair_join_combines_values_by_key() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;
    let ctx = cluster.context();
    let kvs = KvsClient::new(cluster.kvs_coordinator.to_string());

    kvs.put("left", "user-1", "c1", "alice").await.unwrap();
    kvs.put("right", "user-1", "c2", "admin").await.unwrap();
    kvs.put("left", "user-2", "c1", "bob").await.unwrap();

    let left = PairRdd::new("left".to_string(), ctx.clone());
    let right = PairRdd::new("right".to_string(), ctx.clone());
    let joined = left.join(&right).await.unwrap();

    let pairs = joined.collect().await.unwrap();
    assert_eq!(pairs, vec![("user-1".to_string(), "alice,admin".to_string())]);
}

#[tokio::test]
async fn test_group_by_first_char() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;
    let ctx = cluster.context();

    let rdd = ctx
        .parallelize(&["ant".to_string(), "apple".to_string(), "bee".to_string()])
        .await
        .unwrap();
    let grouped = rdd.group_by("first-char").await.unwrap();

    let mut pairs = grouped.collect().await.unwrap();
    pairs.sort();
    assert_eq!(pairs.len(), 3);
    assert!(pairs.iter().filter(|(k, _)| k == "a").count() == 2);
    assert!(pairs.iter().any(|(k, v)| k == "b" && v == "bee"));
}

#[tokio::test]
async fn test_save_as_table_renames_backing_table() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;
    let ctx = cluster.context();
    let kvs = KvsClient::new(cluster.kvs_coordinator.to_string());

    let mut rdd = ctx
        .parallelize(&["x".to_string(), "y".to_string()])
        .await
        .unwrap();
    let original = rdd.table_name().to_string();

    rdd.save_as_table("kept").await.unwrap();
    assert_eq!(rdd.table_name(), "kept");
    assert_eq!(kvs.count("kept").await.unwrap(), 2);
    assert_eq!(kvs.count(&original).await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_function_fails_the_whole_operation() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;
    let ctx = cluster.context();

    let rdd = ctx.parallelize(&["a".to_string()]).await.unwrap();
    let err = rdd.flat_map("not-registered").await.unwrap_err();
    // The partition's 400 aborts the dispatch.
    assert!(matches!(err, Error::PartialWrite(_)));
}

// ============================================================
// COORDINATOR SUBMISSION
// ============================================================

#[tokio::test]
async fn test_submit_runs_registered_job_and_returns_output() {
    let cluster = MiniCluster::start(&["ggggg", "ppppp"]).await;

    let jobs = JobRegistry::new();
    jobs.register("echo-count", |ctx: FlameContext, args: Vec<String>| async move {
        let rdd = ctx.parallelize(&args).await?;
        let count = rdd.count().await?;
        ctx.output(&format!("counted {count}"));
        Ok(())
    });

    let coordinator = FlameCoordinator::new(
        cluster.kvs_coordinator.to_string(),
        cluster.flame_liveness.clone(),
        jobs,
        cluster.functions.clone(),
    );
    let addr = spawn(coordinator::router(coordinator)).await;

    let http = reqwest::Client::new();
    let resp = http
        .post(format!("http://{addr}/submit"))
        .query(&[("class", "echo-count"), ("arg1", "a"), ("arg2", "b")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "counted 2");

    // Unknown job: 400 with a corrective message.
    let resp = http
        .post(format!("http://{addr}/submit"))
        .query(&[("class", "missing-job")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    // Missing class parameter entirely.
    let resp = http
        .post(format!("http://{addr}/submit"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);

    let version = http
        .get(format!("http://{addr}/version"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(version, "v0.1");
}

#[tokio::test]
async fn test_submit_reports_job_errors_as_500() {
    let cluster = MiniCluster::start(&["mmmmm"]).await;

    let jobs = JobRegistry::new();
    jobs.register("always-fails", |_ctx: FlameContext, _args: Vec<String>| async move {
        Err(Error::Job("deliberate failure".into()))
    });

    let coordinator = FlameCoordinator::new(
        cluster.kvs_coordinator.to_string(),
        cluster.flame_liveness.clone(),
        jobs,
        cluster.functions.clone(),
    );
    let addr = spawn(coordinator::router(coordinator)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/submit"))
        .query(&[("class", "always-fails")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 500);
    assert!(resp.text().await.unwrap().contains("deliberate failure"));
}
