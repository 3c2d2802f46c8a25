//! Flame worker: one handler per operator.
//!
//! Each dispatch scans its assigned `[fromKey, toKey)` sub-range of the
//! input table through a fresh KVS client, applies the named operator
//! semantics, and writes results to the output table (fold and the forEach
//! variants return a value or nothing instead). Concurrently executing
//! partitions write to the same output table with no ordering guarantees;
//! overlapping keys resolve last-writer-wins.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use axum::body::Bytes;
use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;

use crate::error::{Error, Result};
use crate::flame::ops::{hash_key, FnRegistry};
use crate::flame::protocol::*;
use crate::kvs::client::{KvsClient, RowScan};
use crate::kvs::handlers::error_response;

pub struct FlameWorker {
    functions: Arc<FnRegistry>,
    active_job: RwLock<Option<String>>,
}

impl FlameWorker {
    pub fn new(functions: Arc<FnRegistry>) -> Arc<Self> {
        Arc::new(Self {
            functions,
            active_job: RwLock::new(None),
        })
    }

    pub fn active_job(&self) -> Option<String> {
        self.active_job.read().unwrap().clone()
    }
}

pub fn router(worker: Arc<FlameWorker>) -> Router {
    Router::new()
        .route(ROUTE_USE_JOB, post(handle_use_job))
        .route(ROUTE_RDD_FLAT_MAP, post(handle_rdd_flat_map))
        .route(ROUTE_RDD_FOR_EACH, post(handle_rdd_for_each))
        .route(ROUTE_RDD_MAP_TO_PAIR, post(handle_rdd_map_to_pair))
        .route(ROUTE_RDD_FLAT_MAP_TO_PAIR, post(handle_rdd_flat_map_to_pair))
        .route(ROUTE_RDD_INTERSECTION, post(handle_rdd_intersection))
        .route(ROUTE_RDD_SAMPLE, post(handle_rdd_sample))
        .route(ROUTE_RDD_GROUP_BY, post(handle_rdd_group_by))
        .route(ROUTE_RDD_DISTINCT, post(handle_rdd_distinct))
        .route(ROUTE_RDD_FOLD, post(handle_rdd_fold))
        .route(ROUTE_RDD_FILTER, post(handle_rdd_filter))
        .route(ROUTE_CONTEXT_FROM_TABLE, post(handle_from_table))
        .route(ROUTE_PAIR_FOLD_BY_KEY, post(handle_pair_fold_by_key))
        .route(ROUTE_PAIR_FLAT_MAP, post(handle_pair_flat_map))
        .route(ROUTE_PAIR_FLAT_MAP_TO_PAIR, post(handle_pair_flat_map_to_pair))
        .route(ROUTE_PAIR_JOIN, post(handle_pair_join))
        .route(ROUTE_PAIR_SAVE_AS_TABLE, post(handle_pair_save_as_table))
        .route(ROUTE_PAIR_FOR_EACH_PAIR, post(handle_pair_for_each_pair))
        .layer(Extension(worker))
}

fn ok_or_error(result: Result<String>) -> (StatusCode, String) {
    match result {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => error_response(e),
    }
}

async fn scan_input(kvs: &KvsClient, params: &OpParams) -> Result<RowScan> {
    kvs.scan(
        &params.input_table,
        params.from_key.as_deref(),
        params.to_key.as_deref(),
    )
    .await
}

fn output_table(params: &OpParams) -> Result<String> {
    params
        .output_table
        .clone()
        .ok_or_else(|| Error::BadRequest("missing outputTable parameter".into()))
}

/// The dispatch body names the registered function (or the other table).
fn body_text(body: &Bytes) -> Result<String> {
    let text = std::str::from_utf8(body)
        .map_err(|_| Error::BadRequest("request body must be UTF-8".into()))?
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(Error::BadRequest("missing function name in request body".into()));
    }
    Ok(text)
}

async fn handle_use_job(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<UseJobParams>,
    body: Bytes,
) -> (StatusCode, String) {
    let name = params
        .job
        .or_else(|| String::from_utf8(body.to_vec()).ok().filter(|s| !s.is_empty()));
    match name {
        Some(name) => {
            tracing::info!("activating job '{}'", name);
            *worker.active_job.write().unwrap() = Some(name);
            (StatusCode::OK, "OK".to_string())
        }
        None => (StatusCode::BAD_REQUEST, "missing job name".to_string()),
    }
}

async fn handle_rdd_flat_map(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_flat_map(&worker, &params, &body).await)
}

async fn rdd_flat_map(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.flat_map(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    let mut counter = 0usize;
    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        for result in function(value) {
            let key = hash_key(&format!("{}-{}", row.key(), counter));
            counter += 1;
            kvs.put(&output, &key, "value", result).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_for_each(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_for_each(&worker, &params, &body).await)
}

async fn rdd_for_each(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.side_effect(&body_text(body)?)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;
    while let Some(row) = scan.next_row().await? {
        if let Some(value) = row.get("value") {
            function(value);
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_map_to_pair(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_map_to_pair(&worker, &params, &body).await)
}

async fn rdd_map_to_pair(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.map_to_pair(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        if let Some((pair_key, pair_value)) = function(value) {
            // The original row key becomes the column name so concurrent
            // partitions never collide on the same cell.
            kvs.put(&output, &pair_key, row.key(), pair_value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_flat_map_to_pair(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_flat_map_to_pair(&worker, &params, &body).await)
}

async fn rdd_flat_map_to_pair(
    worker: &FlameWorker,
    params: &OpParams,
    body: &Bytes,
) -> Result<String> {
    let function = worker.functions.flat_map_to_pair(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    let mut counter = 0usize;
    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        for (pair_key, pair_value) in function(value) {
            let column = hash_key(&format!("{}-{}", row.key(), counter));
            counter += 1;
            kvs.put(&output, &pair_key, &column, pair_value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_intersection(
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_intersection(&params, &body).await)
}

async fn rdd_intersection(params: &OpParams, body: &Bytes) -> Result<String> {
    let other_table = body_text(body)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);

    // The other table is scanned in full; only our own range is bounded.
    let mut other_values = HashSet::new();
    let mut other_scan = kvs.scan(&other_table, None, None).await?;
    while let Some(row) = other_scan.next_row().await? {
        if let Some(value) = row.get("value") {
            other_values.insert(value.to_string());
        }
    }

    let mut seen = HashSet::new();
    let mut scan = scan_input(&kvs, params).await?;
    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        if other_values.contains(value) && seen.insert(value.to_string()) {
            kvs.put(&output, &hash_key(value), "value", value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_sample(Query(params): Query<OpParams>) -> (StatusCode, String) {
    ok_or_error(rdd_sample(&params).await)
}

async fn rdd_sample(params: &OpParams) -> Result<String> {
    let rate = params
        .sampling_rate
        .ok_or_else(|| Error::BadRequest("missing samplingRate parameter".into()))?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        if rand::random::<f64>() < rate {
            let key = hash_key(&format!("{}-sampled", row.key()));
            kvs.put(&output, &key, "value", value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_group_by(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_group_by(&worker, &params, &body).await)
}

async fn rdd_group_by(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.key_by(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        if let Some(group_key) = function(value) {
            kvs.put(&output, &group_key, row.key(), value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_distinct(Query(params): Query<OpParams>) -> (StatusCode, String) {
    ok_or_error(rdd_distinct(&params).await)
}

async fn rdd_distinct(params: &OpParams) -> Result<String> {
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    // The value itself becomes the output row key, so duplicates collapse
    // across all partitions.
    while let Some(row) = scan.next_row().await? {
        if let Some(value) = row.get("value") {
            kvs.put(&output, value, "value", value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_rdd_fold(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_fold(&worker, &params, &body).await)
}

async fn rdd_fold(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.combine(&body_text(body)?)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    let mut acc = params.zero_element.clone().unwrap_or_default();
    while let Some(row) = scan.next_row().await? {
        if let Some(value) = row.get("value") {
            acc = function(&acc, value);
        }
    }
    // The partial accumulator is the response body.
    Ok(acc)
}

async fn handle_rdd_filter(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(rdd_filter(&worker, &params, &body).await)
}

async fn rdd_filter(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let predicate = worker.functions.predicate(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        let Some(value) = row.get("value") else { continue };
        if predicate(value) {
            kvs.put(&output, &hash_key(value), "value", value).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_from_table(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(from_table(&worker, &params, &body).await)
}

async fn from_table(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.row_to_string(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    let mut counter = 0usize;
    while let Some(row) = scan.next_row().await? {
        if let Some(result) = function(&row) {
            let key = hash_key(&format!("{}-{}", row.key(), counter));
            counter += 1;
            kvs.put(&output, &key, "value", result).await?;
        }
    }
    Ok("OK".to_string())
}

async fn handle_pair_fold_by_key(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(pair_fold_by_key(&worker, &params, &body).await)
}

async fn pair_fold_by_key(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.combine(&body_text(body)?)?;
    let output = output_table(params)?;
    let zero = params.zero_element.clone().unwrap_or_default();
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        let mut acc = zero.clone();
        for column in row.columns() {
            if let Some(value) = row.get(column) {
                acc = function(&acc, value);
            }
        }
        kvs.put(&output, row.key(), "value", acc).await?;
    }
    Ok("OK".to_string())
}

async fn handle_pair_flat_map(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(pair_flat_map(&worker, &params, &body).await)
}

async fn pair_flat_map(worker: &FlameWorker, params: &OpParams, body: &Bytes) -> Result<String> {
    let function = worker.functions.pair_flat_map(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    let mut counter = 0usize;
    while let Some(row) = scan.next_row().await? {
        for column in row.columns() {
            let Some(value) = row.get(column) else { continue };
            for result in function(row.key(), value) {
                let key = hash_key(&format!("{}-{}-{}", row.key(), column, counter));
                counter += 1;
                kvs.put(&output, &key, "value", result).await?;
            }
        }
    }
    Ok("OK".to_string())
}

async fn handle_pair_flat_map_to_pair(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(pair_flat_map_to_pair(&worker, &params, &body).await)
}

async fn pair_flat_map_to_pair(
    worker: &FlameWorker,
    params: &OpParams,
    body: &Bytes,
) -> Result<String> {
    let function = worker.functions.pair_flat_map_to_pair(&body_text(body)?)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    let mut counter = 0usize;
    while let Some(row) = scan.next_row().await? {
        for column in row.columns() {
            let Some(value) = row.get(column) else { continue };
            for (pair_key, pair_value) in function(row.key(), value) {
                let new_column = hash_key(&format!("{}-{}-{}", row.key(), column, counter));
                counter += 1;
                kvs.put(&output, &pair_key, &new_column, pair_value).await?;
            }
        }
    }
    Ok("OK".to_string())
}

async fn handle_pair_join(
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(pair_join(&params, &body).await)
}

async fn pair_join(params: &OpParams, body: &Bytes) -> Result<String> {
    let other_table = body_text(body)?;
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        let Some(other_row) = kvs.get_row(&other_table, row.key()).await? else {
            continue;
        };
        for column in row.columns() {
            let Some(value) = row.get(column) else { continue };
            for other_column in other_row.columns() {
                let Some(other_value) = other_row.get(other_column) else {
                    continue;
                };
                let combined = format!("{value},{other_value}");
                let new_column = format!("{}-{}", hash_key(column), hash_key(other_column));
                kvs.put(&output, row.key(), &new_column, combined).await?;
            }
        }
    }
    Ok("OK".to_string())
}

async fn handle_pair_save_as_table(Query(params): Query<OpParams>) -> (StatusCode, String) {
    ok_or_error(pair_save_as_table(&params).await)
}

async fn pair_save_as_table(params: &OpParams) -> Result<String> {
    let output = output_table(params)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        for column in row.columns() {
            if let Some(value) = row.get(column) {
                kvs.put(&output, row.key(), "value", value).await?;
            }
        }
    }
    Ok("OK".to_string())
}

async fn handle_pair_for_each_pair(
    Extension(worker): Extension<Arc<FlameWorker>>,
    Query(params): Query<OpParams>,
    body: Bytes,
) -> (StatusCode, String) {
    ok_or_error(pair_for_each_pair(&worker, &params, &body).await)
}

async fn pair_for_each_pair(
    worker: &FlameWorker,
    params: &OpParams,
    body: &Bytes,
) -> Result<String> {
    let function = worker.functions.pair_side_effect(&body_text(body)?)?;
    let kvs = KvsClient::new(&params.kvs_coordinator);
    let mut scan = scan_input(&kvs, params).await?;

    while let Some(row) = scan.next_row().await? {
        for column in row.columns() {
            if let Some(value) = row.get(column) {
                function(row.key(), value);
            }
        }
    }
    Ok("OK".to_string())
}
