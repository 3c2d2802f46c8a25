//! KVS routing client.
//!
//! Discovers the worker ring from the coordinator on first use and caches it
//! (no automatic refresh — a stale cache is tolerated by fallback probing).
//! Single-key operations route to the worker whose ID is the greatest ID
//! less than or equal to the key, wrapping to the last worker. Table-wide
//! operations fan out to every worker. Range scans stream rows one at a
//! time, per ring segment, without ever buffering a whole table.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, RwLock};

use crate::error::{Error, Result};
use crate::kvs::protocol::*;
use crate::kvs::row::Row;

const DEFAULT_CHUNK_SIZE: usize = 10;
const APPEND_LOCK_SHARDS: usize = 64;

const META_COUNT: &str = "__count";
const META_NEXT_CHUNK: &str = "__nextChunk";
const META_FULL: &str = "__full";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub id: String,
    pub address: String,
}

/// Index of the worker owning `key`: greatest ID <= key, wrapping to the
/// last worker for keys above the maximum ID (and below the minimum).
pub fn route_index(workers: &[WorkerEntry], key: &str) -> usize {
    let mut chosen = workers.len() - 1;
    for i in 0..workers.len().saturating_sub(1) {
        if key >= workers[i].id.as_str() && key < workers[i + 1].id.as_str() {
            chosen = i;
        }
    }
    chosen
}

pub struct KvsClient {
    coordinator: String,
    http: reqwest::Client,
    workers: RwLock<Option<Vec<WorkerEntry>>>,
    append_locks: Vec<Mutex<()>>,
}

impl KvsClient {
    pub fn new(coordinator: impl Into<String>) -> Self {
        Self {
            coordinator: coordinator.into(),
            http: reqwest::Client::new(),
            workers: RwLock::new(None),
            append_locks: (0..APPEND_LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn coordinator(&self) -> &str {
        &self.coordinator
    }

    /// The cached worker ring, downloading it from the coordinator on first
    /// use. Sorted by worker ID.
    pub async fn workers(&self) -> Result<Vec<WorkerEntry>> {
        if let Some(workers) = self.workers.read().await.as_ref() {
            return Ok(workers.clone());
        }
        let mut slot = self.workers.write().await;
        if let Some(workers) = slot.as_ref() {
            return Ok(workers.clone());
        }
        let workers = self.download_workers().await?;
        *slot = Some(workers.clone());
        Ok(workers)
    }

    async fn download_workers(&self) -> Result<Vec<WorkerEntry>> {
        let url = format!("http://{}/workers", self.coordinator);
        let body = self.http.get(&url).send().await?.text().await?;
        let mut lines = body.lines();
        let count: usize = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .ok_or_else(|| Error::Protocol("malformed worker list header".into()))?;
        if count < 1 {
            return Err(Error::Protocol("no active KVS workers".into()));
        }
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let line = lines
                .next()
                .ok_or_else(|| Error::Protocol("truncated worker list".into()))?;
            let (id, address) = line
                .split_once(',')
                .ok_or_else(|| Error::Protocol(format!("malformed worker line '{line}'")))?;
            workers.push(WorkerEntry {
                id: id.to_string(),
                address: address.to_string(),
            });
        }
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    fn data_url(&self, address: &str, table: &str) -> String {
        format!(
            "http://{address}{ENDPOINT_DATA}/{}",
            encode_component(table)
        )
    }

    fn cell_url(&self, address: &str, table: &str, row: &str, column: &str) -> String {
        format!(
            "{}/{}/{}",
            self.data_url(address, table),
            encode_component(row),
            encode_component(column)
        )
    }

    // --- single-key operations ---

    pub async fn put_row(&self, table: &str, row: &Row) -> Result<()> {
        if row.key().is_empty() {
            return Err(Error::BadRequest("row key can't be empty".into()));
        }
        let workers = self.workers().await?;
        let worker = &workers[route_index(&workers, row.key())];
        let resp = self
            .http
            .put(self.data_url(&worker.address, table))
            .body(row.encode())
            .send()
            .await?;
        expect_ok(resp).await
    }

    pub async fn put(&self, table: &str, row: &str, column: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        if row.is_empty() {
            return Err(Error::BadRequest("row key can't be empty".into()));
        }
        let workers = self.workers().await?;
        let worker = &workers[route_index(&workers, row)];
        let resp = self
            .http
            .put(self.cell_url(&worker.address, table, row, column))
            .body(value.into())
            .send()
            .await?;
        expect_ok(resp).await
    }

    /// Conditional write: stores the value only when `ifcolumn` currently
    /// equals `expected`. Returns `false` when the condition did not hold.
    pub async fn put_if(
        &self,
        table: &str,
        row: &str,
        column: &str,
        value: impl Into<Vec<u8>>,
        ifcolumn: &str,
        expected: &str,
    ) -> Result<bool> {
        let workers = self.workers().await?;
        let worker = &workers[route_index(&workers, row)];
        let resp = self
            .http
            .put(self.cell_url(&worker.address, table, row, column))
            .query(&[("ifcolumn", ifcolumn), ("equals", expected)])
            .body(value.into())
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body != "FAIL")
    }

    pub async fn get_row(&self, table: &str, row: &str) -> Result<Option<Row>> {
        if row.is_empty() {
            return Err(Error::BadRequest("row key can't be empty".into()));
        }
        let workers = self.workers().await?;
        let primary = route_index(&workers, row);
        let order = probe_order(workers.len(), primary);

        for (attempt, idx) in order.into_iter().enumerate() {
            let url = format!(
                "{}/{}",
                self.data_url(&workers[idx].address, table),
                encode_component(row)
            );
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body = resp.bytes().await?;
                    return Ok(Some(Row::decode(&body)?));
                }
                Ok(_) => continue,
                // The primary being unreachable is worth surfacing; probe
                // failures beyond it are not.
                Err(e) if attempt == 0 && workers.len() == 1 => return Err(e.into()),
                Err(_) => continue,
            }
        }
        Ok(None)
    }

    /// Reads one column. Tries the owning worker first and, on a miss, probes
    /// every other worker in turn (tolerates a stale ring cache at the cost
    /// of extra requests).
    pub async fn get(&self, table: &str, row: &str, column: &str) -> Result<Option<Vec<u8>>> {
        if row.is_empty() {
            return Err(Error::BadRequest("row key can't be empty".into()));
        }
        let workers = self.workers().await?;
        let primary = route_index(&workers, row);

        for idx in probe_order(workers.len(), primary) {
            let url = self.cell_url(&workers[idx].address, table, row, column);
            match self.http.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(Some(resp.bytes().await?.to_vec()))
                }
                _ => continue,
            }
        }
        Ok(None)
    }

    pub async fn exists_row(&self, table: &str, row: &str) -> Result<bool> {
        Ok(self.get_row(table, row).await?.is_some())
    }

    pub async fn delete_row(&self, table: &str, row: &str) -> Result<()> {
        if row.is_empty() {
            return Err(Error::BadRequest("row key can't be empty".into()));
        }
        let workers = self.workers().await?;
        let worker = &workers[route_index(&workers, row)];
        let url = format!(
            "{}/{}",
            self.data_url(&worker.address, table),
            encode_component(row)
        );
        let resp = self.http.delete(&url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    // --- table-wide operations ---

    /// Renames a table on every worker. True only when every reachable
    /// worker acknowledged; individual transport failures are ignored.
    pub async fn rename(&self, old: &str, new: &str) -> Result<bool> {
        let workers = self.workers().await?;
        let mut ok = true;
        for worker in &workers {
            let url = format!(
                "http://{}{ENDPOINT_RENAME}/{}",
                worker.address,
                encode_component(old)
            );
            match self.http.put(&url).body(new.to_string()).send().await {
                Ok(resp) => {
                    let body = resp.text().await.unwrap_or_default();
                    ok &= body == "OK";
                }
                Err(e) => {
                    tracing::warn!("rename request to {} failed: {}", worker.address, e);
                }
            }
        }
        Ok(ok)
    }

    /// Deletes a table on every worker, best-effort.
    pub async fn delete_table(&self, table: &str) -> Result<()> {
        let workers = self.workers().await?;
        for worker in &workers {
            let url = format!(
                "http://{}{ENDPOINT_DELETE}/{}",
                worker.address,
                encode_component(table)
            );
            if let Err(e) = self.http.put(&url).send().await {
                tracing::warn!("delete request to {} failed: {}", worker.address, e);
            }
        }
        Ok(())
    }

    /// Total row count, summed across workers that answered.
    pub async fn count(&self, table: &str) -> Result<usize> {
        let workers = self.workers().await?;
        let mut total = 0;
        for worker in &workers {
            let url = format!(
                "http://{}{ENDPOINT_COUNT}/{}",
                worker.address,
                encode_component(table)
            );
            if let Ok(resp) = self.http.get(&url).send().await {
                if resp.status().is_success() {
                    if let Ok(text) = resp.text().await {
                        total += text.trim().parse::<usize>().unwrap_or(0);
                    }
                }
            }
        }
        Ok(total)
    }

    // --- range scan ---

    pub async fn scan(
        &self,
        table: &str,
        start_row: Option<&str>,
        end_row_exclusive: Option<&str>,
    ) -> Result<RowScan> {
        let workers = self.workers().await?;
        let segments = scan_segments(&workers, start_row, end_row_exclusive);
        Ok(RowScan {
            http: self.http.clone(),
            table: table.to_string(),
            segments,
            next_segment: 0,
            current: None,
            buf: Vec::new(),
        })
    }

    // --- capped, deduplicated, chunked append ---

    fn append_lock(&self, table: &str, row: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        table.hash(&mut hasher);
        row.hash(&mut hasher);
        &self.append_locks[(hasher.finish() as usize) % APPEND_LOCK_SHARDS]
    }

    async fn read_string_column(&self, table: &str, row: &str, column: &str) -> Result<Option<String>> {
        Ok(self
            .get(table, row, column)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
    }

    async fn read_int_column(&self, table: &str, row: &str, column: &str, default: usize) -> Result<usize> {
        Ok(self
            .read_string_column(table, row, column)
            .await?
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(default))
    }

    /// Maintains a bounded, deduplicated, chunked posting list under
    /// `columnPrefix`-numbered columns. The effective cap is
    /// `min(max_items, max_doc_frequency)` (a zero `max_doc_frequency`
    /// means "no extra cap"). All bookkeeping (`__count`, `__nextChunk`,
    /// `__full`) is persisted as ordinary columns so the state survives
    /// restarts. The guarding lock only serializes callers within this
    /// process.
    pub async fn append_capped(
        &self,
        table: &str,
        row: &str,
        column_prefix: &str,
        value: &str,
        max_items: usize,
        sep: char,
        chunk_size: usize,
        max_doc_frequency: usize,
    ) -> Result<()> {
        if row.is_empty() {
            return Err(Error::BadRequest("row key can't be empty".into()));
        }
        if value.is_empty() {
            return Ok(());
        }
        let chunk_size = if chunk_size == 0 { DEFAULT_CHUNK_SIZE } else { chunk_size };
        let mut effective_cap = max_items;
        if max_doc_frequency > 0 && max_doc_frequency < effective_cap {
            effective_cap = max_doc_frequency;
        }
        if effective_cap == 0 {
            return Ok(());
        }

        let _guard = self.append_lock(table, row).lock().await;

        if self.read_string_column(table, row, META_FULL).await?.as_deref() == Some("1") {
            return Ok(());
        }

        let mut count = self.read_int_column(table, row, META_COUNT, 0).await?;
        if count >= effective_cap {
            self.put(table, row, META_FULL, "1").await?;
            return Ok(());
        }
        let mut next_chunk = self.read_int_column(table, row, META_NEXT_CHUNK, 0).await?;

        loop {
            if count >= effective_cap {
                self.put(table, row, META_FULL, "1").await?;
                return Ok(());
            }

            let chunk_column = chunk_column_name(column_prefix, next_chunk);
            let chunk_value = self
                .read_string_column(table, row, &chunk_column)
                .await?
                .filter(|v| !v.is_empty());

            if let Some(existing) = &chunk_value {
                if existing.split(sep).any(|item| item == value) {
                    return Ok(());
                }
            }

            match chunk_value {
                None => {
                    self.put(table, row, &chunk_column, value).await?;
                    count += 1;
                    self.put(table, row, META_COUNT, count.to_string()).await?;
                    self.put(table, row, META_NEXT_CHUNK, next_chunk.to_string()).await?;
                    if count >= effective_cap {
                        self.put(table, row, META_FULL, "1").await?;
                    }
                    return Ok(());
                }
                Some(existing) => {
                    let chunk_count = existing.split(sep).count();
                    if chunk_count >= chunk_size {
                        next_chunk += 1;
                        self.put(table, row, META_NEXT_CHUNK, next_chunk.to_string()).await?;
                        continue;
                    }
                    let updated = format!("{existing}{sep}{value}");
                    self.put(table, row, &chunk_column, updated).await?;
                    count += 1;
                    if chunk_count + 1 >= chunk_size {
                        next_chunk += 1;
                    }
                    self.put(table, row, META_COUNT, count.to_string()).await?;
                    self.put(table, row, META_NEXT_CHUNK, next_chunk.to_string()).await?;
                    if count >= effective_cap {
                        self.put(table, row, META_FULL, "1").await?;
                    }
                    return Ok(());
                }
            }
        }
    }
}

fn chunk_column_name(prefix: &str, index: usize) -> String {
    let prefix = if prefix.is_empty() { "chunk" } else { prefix };
    format!("{prefix}{index:04}")
}

/// Primary first, then every other worker in ring order.
fn probe_order(len: usize, primary: usize) -> Vec<usize> {
    let mut order = Vec::with_capacity(len);
    order.push(primary);
    order.extend((0..len).filter(|&i| i != primary));
    order
}

#[derive(Debug, Clone)]
struct ScanSegment {
    address: String,
    start: Option<String>,
    end: Option<String>,
}

/// Ring segments intersecting `[start, end)`, in key order. Keys below the
/// first worker ID live on the last worker, so a spanning request begins
/// with that wraparound segment.
fn scan_segments(
    workers: &[WorkerEntry],
    start: Option<&str>,
    end: Option<&str>,
) -> Vec<ScanSegment> {
    let mut segments = Vec::new();
    let n = workers.len();
    let first_id = workers[0].id.as_str();

    if start.is_none() || start.unwrap() < first_id {
        let seg_end = match end {
            Some(e) if e < first_id => Some(e.to_string()),
            _ => Some(first_id.to_string()),
        };
        segments.push(ScanSegment {
            address: workers[n - 1].address.clone(),
            start: start.map(|s| s.to_string()),
            end: seg_end,
        });
    }

    for i in 0..n {
        let in_lower = match start {
            None => true,
            Some(s) => i == n - 1 || s < workers[i + 1].id.as_str(),
        };
        let in_upper = match end {
            None => true,
            Some(e) => e > workers[i].id.as_str(),
        };
        if !(in_lower && in_upper) {
            continue;
        }
        let seg_start = match start {
            Some(s) if s > workers[i].id.as_str() => s.to_string(),
            _ => workers[i].id.clone(),
        };
        let seg_end = match end {
            Some(e) if i == n - 1 || e < workers[i + 1].id.as_str() => Some(e.to_string()),
            _ => {
                if i < n - 1 {
                    Some(workers[i + 1].id.clone())
                } else {
                    None
                }
            }
        };
        segments.push(ScanSegment {
            address: workers[i].address.clone(),
            start: Some(seg_start),
            end: seg_end,
        });
    }

    segments
}

/// Streaming iterator over a multi-segment range scan. Holds at most one
/// open connection and one partially decoded row's worth of buffered bytes.
pub struct RowScan {
    http: reqwest::Client,
    table: String,
    segments: Vec<ScanSegment>,
    next_segment: usize,
    current: Option<reqwest::Response>,
    buf: Vec<u8>,
}

impl RowScan {
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            if let Some((row, used)) = Row::decode_stream(&self.buf)? {
                self.buf.drain(..used);
                return Ok(Some(row));
            }

            if let Some(resp) = &mut self.current {
                match resp.chunk().await? {
                    Some(bytes) => {
                        self.buf.extend_from_slice(&bytes);
                        continue;
                    }
                    None => {
                        if self.buf.iter().any(|&b| b != b'\n') {
                            tracing::warn!(
                                "scan segment for '{}' ended mid-row; dropping partial data",
                                self.table
                            );
                        }
                        self.buf.clear();
                        self.current = None;
                    }
                }
            }

            // Advance to the next segment's connection.
            loop {
                if self.next_segment >= self.segments.len() {
                    return Ok(None);
                }
                let segment = self.segments[self.next_segment].clone();
                self.next_segment += 1;

                let url = format!(
                    "http://{}{ENDPOINT_DATA}/{}",
                    segment.address,
                    encode_component(&self.table)
                );
                let mut query: Vec<(&str, String)> = Vec::new();
                if let Some(s) = segment.start {
                    query.push(("startRow", s));
                }
                if let Some(e) = segment.end {
                    query.push(("endRowExclusive", e));
                }

                match self.http.get(&url).query(&query).send().await {
                    Ok(resp) if resp.status().as_u16() == 404 => continue,
                    Ok(resp) if resp.status().is_success() => {
                        self.current = Some(resp);
                        break;
                    }
                    Ok(resp) => {
                        let status = resp.status().as_u16();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(Error::Status { status, body });
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// Drains the remaining rows into a vector. Convenience for callers that
    /// want the whole (small) result set.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

async fn expect_ok(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() || body != "OK" {
        return Err(Error::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(())
}
