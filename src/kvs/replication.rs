//! Background replication manager.
//!
//! Best-effort, passive replication that never blocks or fails a foreground
//! request. After the owning worker accepts a write, the manager forwards it
//! to the two ring successors — but only when a hash-prefix rule says this
//! worker is primary for the key. That rule intentionally differs from the
//! routing client's raw-ID comparison; replication is gap-filling either
//! way. A second loop performs anti-entropy: every interval it pulls each
//! successor's table/row inventory and fetches any row present remotely but
//! absent locally. No value-level conflict resolution happens here.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::{watch, RwLock};

use crate::error::{Error, Result};
use crate::kvs::protocol::{
    encode_component, ENDPOINT_DATA, ENDPOINT_REPL_ROWS, ENDPOINT_REPL_TABLES,
};
use crate::kvs::row::Row;
use crate::kvs::store::TableStore;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5);
const ANTI_ENTROPY_INTERVAL: Duration = Duration::from_secs(30);
const PEER_TIMEOUT: Duration = Duration::from_millis(2000);
const PUSH_ATTEMPTS: usize = 3;

/// SHA-256 digest of a row's key, column names, and values. Used as the
/// anti-entropy content hash.
pub fn hash_row(row: &Row) -> String {
    let mut hasher = Sha256::new();
    hasher.update(row.key().as_bytes());
    for column in row.columns() {
        hasher.update(column.as_bytes());
        if let Some(value) = row.get_bytes(column) {
            hasher.update(value);
        }
    }
    hex::encode(hasher.finalize())
}

fn key_hash_prefix(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    digest[..4].to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerWorker {
    id: String,
    address: String,
}

pub struct ReplicationManager {
    coordinator: String,
    self_id: String,
    store: Arc<TableStore>,
    http: reqwest::Client,
    peers: RwLock<Vec<PeerWorker>>,
}

impl ReplicationManager {
    pub fn new(
        coordinator: impl Into<String>,
        self_id: impl Into<String>,
        store: Arc<TableStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            coordinator: coordinator.into(),
            self_id: self_id.into(),
            store,
            http: reqwest::Client::new(),
            peers: RwLock::new(Vec::new()),
        })
    }

    /// Spawns the worker-list refresh and anti-entropy loops. Both exit when
    /// the shutdown channel flips.
    pub fn start(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let manager = self.clone();
        let mut rx = shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = manager.refresh_peers().await {
                            tracing::debug!("replication peer refresh failed: {}", e);
                        }
                    }
                    _ = rx.changed() => {
                        tracing::info!("replication refresh loop shutting down");
                        return;
                    }
                }
            }
        });

        let manager = self.clone();
        let mut rx = shutdown;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ANTI_ENTROPY_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.sync_once().await,
                    _ = rx.changed() => {
                        tracing::info!("anti-entropy loop shutting down");
                        return;
                    }
                }
            }
        });
    }

    async fn refresh_peers(&self) -> Result<()> {
        let url = format!("http://{}/workers", self.coordinator);
        let body = self
            .http
            .get(&url)
            .timeout(PEER_TIMEOUT)
            .send()
            .await?
            .text()
            .await?;
        let mut peers = Vec::new();
        for line in body.lines().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((id, address)) = line.split_once(',') {
                peers.push(PeerWorker {
                    id: id.to_string(),
                    address: address.to_string(),
                });
            }
        }
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        *self.peers.write().await = peers;
        Ok(())
    }

    /// Test-only seeding of the peer ring (no coordinator involved).
    #[cfg(test)]
    pub(crate) async fn set_peers_for_test(&self, entries: Vec<(String, String)>) {
        let mut peers: Vec<PeerWorker> = entries
            .into_iter()
            .map(|(id, address)| PeerWorker { id, address })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        *self.peers.write().await = peers;
    }

    async fn ring(&self) -> Vec<PeerWorker> {
        self.peers.read().await.clone()
    }

    fn self_index(&self, ring: &[PeerWorker]) -> Option<usize> {
        ring.iter().position(|p| p.id == self.self_id)
    }

    /// Primary test by hashed key prefix: the first worker whose ID sorts at
    /// or above the prefix owns the key, wrapping to the smallest ID.
    async fn is_primary_for_key(&self, key: &str) -> bool {
        let ring = self.ring().await;
        if ring.is_empty() {
            return true;
        }
        let prefix = key_hash_prefix(key);
        for peer in &ring {
            if peer.id.as_str() >= prefix.as_str() {
                return peer.id == self.self_id;
            }
        }
        ring[0].id == self.self_id
    }

    /// Pushes an accepted write to the two ring successors. Fire-and-forget;
    /// every failure is logged and swallowed.
    pub async fn forward_write(&self, table: &str, row_key: &str, column: &str, value: &[u8]) {
        if !self.is_primary_for_key(row_key).await {
            return;
        }
        let ring = self.ring().await;
        if ring.len() < 2 {
            return;
        }
        let Some(idx) = self.self_index(&ring) else {
            return;
        };
        let first = &ring[(idx + 1) % ring.len()];
        let second = &ring[(idx + 2) % ring.len()];
        for successor in [first, second] {
            if successor.id == self.self_id {
                continue;
            }
            if let Err(e) = self
                .replicate_to(&successor.address, table, row_key, column, value)
                .await
            {
                tracing::warn!(
                    "replication push to {} failed: {}",
                    successor.address,
                    e
                );
            }
        }
    }

    /// Full-row variant of [`forward_write`](Self::forward_write).
    pub async fn forward_row(&self, table: &str, row: &Row) {
        if !self.is_primary_for_key(row.key()).await {
            return;
        }
        let ring = self.ring().await;
        if ring.len() < 2 {
            return;
        }
        let Some(idx) = self.self_index(&ring) else {
            return;
        };
        let encoded = row.encode();
        for offset in [1, 2] {
            let successor = &ring[(idx + offset) % ring.len()];
            if successor.id == self.self_id {
                continue;
            }
            let url = format!(
                "http://{}{ENDPOINT_DATA}/{}",
                successor.address,
                encode_component(table)
            );
            let result = self
                .http
                .put(&url)
                .query(&[("replicated", "true")])
                .body(encoded.clone())
                .timeout(PEER_TIMEOUT)
                .send()
                .await;
            if let Err(e) = result {
                tracing::warn!("row replication push to {} failed: {}", successor.address, e);
            }
        }
    }

    async fn replicate_to(
        &self,
        address: &str,
        table: &str,
        row_key: &str,
        column: &str,
        value: &[u8],
    ) -> Result<()> {
        let url = format!(
            "http://{address}{ENDPOINT_DATA}/{}/{}/{}",
            encode_component(table),
            encode_component(row_key),
            encode_component(column)
        );

        let mut delay_ms = 150u64;
        for attempt in 0..PUSH_ATTEMPTS {
            let result = self
                .http
                .put(&url)
                .query(&[("replicated", "true")])
                .body(value.to_vec())
                .timeout(PEER_TIMEOUT)
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    return Err(Error::Status {
                        status: resp.status().as_u16(),
                        body: resp.text().await.unwrap_or_default(),
                    })
                }
                Err(e) => {
                    if attempt + 1 == PUSH_ATTEMPTS {
                        return Err(e.into());
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }
        Err(Error::Protocol("retry attempts exhausted".into()))
    }

    /// One anti-entropy round: pull both successors' inventories and fetch
    /// any row they hold that is missing locally.
    pub async fn sync_once(&self) {
        let ring = self.ring().await;
        if ring.len() < 2 {
            return;
        }
        let Some(idx) = self.self_index(&ring) else {
            return;
        };
        let first = ring[(idx + 1) % ring.len()].clone();
        let second = ring[(idx + 2) % ring.len()].clone();
        for successor in [first, second] {
            if successor.id == self.self_id {
                continue;
            }
            if let Err(e) = self.sync_from(&successor).await {
                tracing::debug!("anti-entropy sync from {} failed: {}", successor.address, e);
            }
        }
    }

    async fn sync_from(&self, peer: &PeerWorker) -> Result<()> {
        let tables_url = format!("http://{}{ENDPOINT_REPL_TABLES}", peer.address);
        let tables = self.fetch_lines(&tables_url).await?;
        for table in tables {
            let rows_url = format!(
                "http://{}{ENDPOINT_REPL_ROWS}/{}",
                peer.address,
                encode_component(&table)
            );
            let lines = match self.fetch_lines(&rows_url).await {
                Ok(lines) => lines,
                Err(e) => {
                    tracing::debug!("inventory fetch for '{}' failed: {}", table, e);
                    continue;
                }
            };
            for line in lines {
                let Some((key, _digest)) = line.split_once(' ') else {
                    continue;
                };
                let have = matches!(self.store.get_row(&table, key), Ok(Some(_)));
                if have {
                    continue;
                }
                match self.fetch_row(&peer.address, &table, key).await {
                    Ok(Some(row)) => {
                        if let Err(e) = self.store.put_row(&table, row) {
                            tracing::warn!("storing repaired row '{}' failed: {}", key, e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!("row fetch '{}'/'{}' failed: {}", table, key, e);
                    }
                }
            }
        }
        Ok(())
    }

    async fn fetch_row(&self, address: &str, table: &str, key: &str) -> Result<Option<Row>> {
        let url = format!(
            "http://{address}{ENDPOINT_DATA}/{}/{}",
            encode_component(table),
            encode_component(key)
        );
        let resp = self.http.get(&url).timeout(PEER_TIMEOUT).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let body = resp.bytes().await?;
        Ok(Some(Row::decode(&body)?))
    }

    async fn fetch_lines(&self, url: &str) -> Result<Vec<String>> {
        let body = self
            .http
            .get(url)
            .timeout(PEER_TIMEOUT)
            .send()
            .await?
            .text()
            .await?;
        Ok(body
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}
