//! Job-facing context and the generic dispatch primitive.
//!
//! One context exists per job invocation. Every RDD transformation funnels
//! through [`FlameContext::invoke_operation`]: ask the partitioner for the
//! current assignment plan, POST the operator to each assigned Flame worker
//! in parallel, and block until every partition responds. Any non-200
//! response or transport error fails the *entire* operation — no retries,
//! no skipping — which can leave a partially written output table behind;
//! that gap is documented, not hidden.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::flame::ops::{hash_key, FnRegistry};
use crate::flame::partitioner::Partitioner;
use crate::flame::protocol::*;
use crate::flame::rdd::Rdd;
use crate::kvs::client::KvsClient;
use crate::liveness::LivenessRegistry;

struct ContextInner {
    kvs: KvsClient,
    liveness: Arc<LivenessRegistry>,
    functions: Arc<FnRegistry>,
    http: reqwest::Client,
    output: Mutex<String>,
    table_seq: AtomicU32,
}

/// Cheaply cloneable handle; all clones share the same output buffer and
/// table-name sequence.
#[derive(Clone)]
pub struct FlameContext {
    inner: Arc<ContextInner>,
}

impl FlameContext {
    pub fn new(
        kvs_coordinator: &str,
        liveness: Arc<LivenessRegistry>,
        functions: Arc<FnRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                kvs: KvsClient::new(kvs_coordinator),
                liveness,
                functions,
                http: reqwest::Client::new(),
                output: Mutex::new(String::new()),
                table_seq: AtomicU32::new(0),
            }),
        }
    }

    pub fn kvs(&self) -> &KvsClient {
        &self.inner.kvs
    }

    pub fn functions(&self) -> &FnRegistry {
        &self.inner.functions
    }

    /// Appends to the job's output buffer, returned verbatim to the
    /// submitter when the job finishes.
    pub fn output(&self, text: &str) {
        self.inner.output.lock().unwrap().push_str(text);
    }

    pub fn take_output(&self) -> String {
        let output = self.inner.output.lock().unwrap();
        if output.is_empty() {
            "No output".to_string()
        } else {
            output.clone()
        }
    }

    /// Fresh output-table name; timestamp plus per-context sequence so names
    /// never collide within one context.
    fn next_table_name(&self, persistent: bool) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let seq = self.inner.table_seq.fetch_add(1, Ordering::SeqCst);
        if persistent {
            format!("pt-rdd-{millis}-{seq}")
        } else {
            format!("rdd-{millis}-{seq}")
        }
    }

    /// Writes each element as one row (hashed sequence index as key, single
    /// `value` column) into a fresh table and returns a handle to it.
    pub async fn parallelize(&self, items: &[String]) -> Result<Rdd> {
        self.parallelize_into(items, false).await
    }

    /// `parallelize` into a persistent (`pt-`) table.
    pub async fn parallelize_to_pt(&self, items: &[String]) -> Result<Rdd> {
        self.parallelize_into(items, true).await
    }

    async fn parallelize_into(&self, items: &[String], persistent: bool) -> Result<Rdd> {
        let table = self.next_table_name(persistent);
        for (index, item) in items.iter().enumerate() {
            let key = hash_key(&index.to_string());
            self.inner.kvs.put(&table, &key, "value", item.as_str()).await?;
        }
        Ok(Rdd::new(table, self.clone()))
    }

    /// Derives an RDD from an existing table by running the named
    /// row-to-string function over every row.
    pub async fn from_table(&self, table: &str, function: &str) -> Result<Rdd> {
        let output = self
            .invoke_operation(
                table,
                None,
                ROUTE_CONTEXT_FROM_TABLE,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(Rdd::new(output, self.clone()))
    }

    /// The generic dispatch primitive: one POST per partition, all in
    /// parallel, joined before returning the (possibly freshly named)
    /// output table.
    pub async fn invoke_operation(
        &self,
        input_table: &str,
        output_table: Option<&str>,
        route: &str,
        body: Vec<u8>,
        extra_params: &[(&str, String)],
        persistent: bool,
    ) -> Result<String> {
        let output = match output_table {
            Some(name) => name.to_string(),
            None => self.next_table_name(persistent),
        };
        self.dispatch(input_table, Some(&output), route, body, extra_params)
            .await?;
        Ok(output)
    }

    /// Fold variant: partitions reduce locally and return partial
    /// accumulators as response bodies instead of writing rows.
    pub async fn invoke_fold_operation(
        &self,
        input_table: &str,
        route: &str,
        body: Vec<u8>,
        extra_params: &[(&str, String)],
    ) -> Result<Vec<String>> {
        self.dispatch(input_table, None, route, body, extra_params)
            .await
    }

    async fn dispatch(
        &self,
        input_table: &str,
        output_table: Option<&str>,
        route: &str,
        body: Vec<u8>,
        extra_params: &[(&str, String)],
    ) -> Result<Vec<String>> {
        let kvs_workers = self.inner.kvs.workers().await?;
        let flame_workers = self.inner.liveness.live_addresses();
        let partitions = Partitioner::from_ring(&kvs_workers, &flame_workers).assign()?;

        tracing::debug!(
            "dispatching {} over {} partition(s), input '{}'",
            route,
            partitions.len(),
            input_table
        );

        let mut handles = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let http = self.inner.http.clone();
            let url = format!("http://{}{}", partition.flame_worker, route);
            let mut query: Vec<(String, String)> = vec![
                ("inputTable".into(), input_table.to_string()),
                ("kvsCoordinator".into(), self.inner.kvs.coordinator().to_string()),
            ];
            if let Some(output) = output_table {
                query.push(("outputTable".into(), output.to_string()));
            }
            if let Some(from) = partition.from_key {
                query.push(("fromKey".into(), from));
            }
            if let Some(to) = partition.to_key_exclusive {
                query.push(("toKey".into(), to));
            }
            for (name, value) in extra_params {
                query.push(((*name).to_string(), value.clone()));
            }
            let body = body.clone();

            handles.push(tokio::spawn(async move {
                let resp = http.post(&url).query(&query).body(body).send().await?;
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                Ok::<(u16, String), reqwest::Error>((status, text))
            }));
        }

        let mut bodies = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok((status, text))) if (200..300).contains(&status) => bodies.push(text),
                Ok(Ok((status, text))) => {
                    return Err(Error::PartialWrite(format!(
                        "partition {index} of {route} returned status {status}: {text}"
                    )))
                }
                Ok(Err(e)) => {
                    return Err(Error::PartialWrite(format!(
                        "partition {index} of {route} failed: {e}"
                    )))
                }
                Err(e) => {
                    return Err(Error::PartialWrite(format!(
                        "partition {index} of {route} panicked: {e}"
                    )))
                }
            }
        }
        Ok(bodies)
    }
}
