//! Worker-side table storage.
//!
//! Ephemeral tables live in memory; persistent tables (`pt-` prefix) are
//! written to disk, one file per row, bucketed into `_xy/` subdirectories to
//! bound directory fan-out. A worker stores whatever rows it is sent —
//! ownership is a client-side convention and is not enforced here.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::kvs::row::Row;

pub const PERSISTENT_PREFIX: &str = "pt-";

/// Encoded key length at which row files move into `_xy/` buckets.
const BUCKET_THRESHOLD: usize = 6;

pub fn is_persistent(table: &str) -> bool {
    table.starts_with(PERSISTENT_PREFIX)
}

/// Filesystem-safe row key encoding. Alphanumerics and `-`/`.` pass through;
/// every other byte becomes `_` plus two hex digits.
pub fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' => out.push(b as char),
            _ => {
                out.push('_');
                out.push_str(&format!("{b:02x}"));
            }
        }
    }
    out
}

pub struct TableStore {
    storage_dir: PathBuf,
    tables: DashMap<String, DashMap<String, Row>>,
    versions: DashMap<String, DashMap<String, u32>>,
    history: DashMap<String, DashMap<String, DashMap<u32, Row>>>,
}

impl TableStore {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self> {
        let storage_dir = storage_dir.into();
        fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            tables: DashMap::new(),
            versions: DashMap::new(),
            history: DashMap::new(),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    fn row_file(&self, table: &str, key: &str) -> PathBuf {
        let encoded = encode_key(key);
        let table_dir = self.storage_dir.join(table);
        if encoded.len() >= BUCKET_THRESHOLD {
            table_dir.join(format!("_{}", &encoded[..2])).join(encoded)
        } else {
            table_dir.join(encoded)
        }
    }

    /// Stores a row without touching the version counters. Used by the
    /// replication manager when gap-filling.
    pub fn put_row(&self, table: &str, row: Row) -> Result<()> {
        if is_persistent(table) {
            let path = self.row_file(table, row.key());
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, row.encode())?;
        } else {
            self.tables
                .entry(table.to_string())
                .or_default()
                .insert(row.key().to_string(), row);
        }
        Ok(())
    }

    /// Stores a row, bumps the per-(table,row) version counter and retains
    /// the new version in the in-memory history. Returns the new version.
    pub fn put_row_versioned(&self, table: &str, row: Row) -> Result<u32> {
        let version = self.next_version(table, row.key());
        self.history
            .entry(table.to_string())
            .or_default()
            .entry(row.key().to_string())
            .or_default()
            .insert(version, row.clone());
        self.put_row(table, row)?;
        Ok(version)
    }

    /// Single-column upsert on top of whatever row currently exists.
    pub fn put_cell(&self, table: &str, key: &str, column: &str, value: Vec<u8>) -> Result<u32> {
        let mut row = self.get_row(table, key)?.unwrap_or_else(|| Row::new(key));
        row.set(column, value);
        self.put_row_versioned(table, row)
    }

    pub fn get_row(&self, table: &str, key: &str) -> Result<Option<Row>> {
        if is_persistent(table) {
            self.read_from_disk(table, key)
        } else {
            Ok(self
                .tables
                .get(table)
                .and_then(|t| t.get(key).map(|r| r.clone())))
        }
    }

    fn read_from_disk(&self, table: &str, key: &str) -> Result<Option<Row>> {
        let mut path = self.row_file(table, key);
        if !path.exists() {
            // Older layouts kept long keys at the table root.
            let root = self.storage_dir.join(table).join(encode_key(key));
            if !root.exists() {
                return Ok(None);
            }
            path = root;
        }
        let bytes = fs::read(path)?;
        Ok(Some(Row::decode(&bytes)?))
    }

    pub fn get_row_version(&self, table: &str, key: &str, version: u32) -> Option<Row> {
        self.history
            .get(table)?
            .get(key)?
            .get(&version)
            .map(|r| r.clone())
    }

    pub fn current_version(&self, table: &str, key: &str) -> u32 {
        self.versions
            .get(table)
            .and_then(|t| t.get(key).map(|v| *v))
            .unwrap_or(0)
    }

    fn next_version(&self, table: &str, key: &str) -> u32 {
        let table_versions = self.versions.entry(table.to_string()).or_default();
        let mut entry = table_versions.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn delete_row(&self, table: &str, key: &str) -> Result<()> {
        if is_persistent(table) {
            let table_dir = self.storage_dir.join(table);
            if !table_dir.is_dir() {
                return Err(Error::NotFound(format!("table '{table}'")));
            }
            let path = self.row_file(table, key);
            if !path.is_file() {
                return Err(Error::NotFound(format!("row '{key}' in '{table}'")));
            }
            fs::remove_file(path)?;
        } else {
            let table_map = self
                .tables
                .get(table)
                .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
            if table_map.remove(key).is_none() {
                return Err(Error::NotFound(format!("row '{key}' in '{table}'")));
            }
        }
        if let Some(versions) = self.versions.get(table) {
            versions.remove(key);
        }
        if let Some(history) = self.history.get(table) {
            history.remove(key);
        }
        Ok(())
    }

    pub fn delete_table(&self, table: &str) -> Result<()> {
        if is_persistent(table) {
            let table_dir = self.storage_dir.join(table);
            if !table_dir.is_dir() {
                return Err(Error::NotFound(format!("table '{table}'")));
            }
            fs::remove_dir_all(table_dir)?;
        } else if self.tables.remove(table).is_none() {
            return Err(Error::NotFound(format!("table '{table}'")));
        }
        self.versions.remove(table);
        self.history.remove(table);
        Ok(())
    }

    /// Atomic rename. Fails with `BadRequest` when the two names differ in
    /// persistence class, `NotFound`/`Conflict` on missing source or an
    /// existing target.
    pub fn rename_table(&self, old: &str, new: &str) -> Result<()> {
        if is_persistent(old) != is_persistent(new) {
            return Err(Error::BadRequest(format!(
                "cannot rename '{old}' to '{new}': persistence class differs"
            )));
        }
        if is_persistent(old) {
            let src = self.storage_dir.join(old);
            if !src.is_dir() {
                return Err(Error::NotFound(format!("table '{old}'")));
            }
            let dst = self.storage_dir.join(new);
            if dst.is_dir() {
                return Err(Error::Conflict(format!("table '{new}' already exists")));
            }
            fs::rename(src, dst)?;
        } else {
            if !self.tables.contains_key(old) {
                return Err(Error::NotFound(format!("table '{old}'")));
            }
            if self.tables.contains_key(new) {
                return Err(Error::Conflict(format!("table '{new}' already exists")));
            }
            if let Some((_, rows)) = self.tables.remove(old) {
                self.tables.insert(new.to_string(), rows);
            }
            if let Some((_, versions)) = self.versions.remove(old) {
                self.versions.insert(new.to_string(), versions);
            }
            if let Some((_, history)) = self.history.remove(old) {
                self.history.insert(new.to_string(), history);
            }
        }
        Ok(())
    }

    /// Rows with keys in `[start, end)`, sorted by key.
    pub fn scan(
        &self,
        table: &str,
        start: Option<&str>,
        end_exclusive: Option<&str>,
    ) -> Result<Vec<Row>> {
        let mut rows = if is_persistent(table) {
            let table_dir = self.storage_dir.join(table);
            if !table_dir.is_dir() {
                return Err(Error::NotFound(format!("table '{table}'")));
            }
            let mut rows = Vec::new();
            for file in list_row_files(&table_dir)? {
                match fs::read(&file).map_err(Error::from).and_then(|b| Row::decode(&b)) {
                    Ok(row) => rows.push(row),
                    Err(e) => tracing::warn!("skipping unreadable row file {:?}: {}", file, e),
                }
            }
            rows
        } else {
            let table_map = self
                .tables
                .get(table)
                .ok_or_else(|| Error::NotFound(format!("table '{table}'")))?;
            table_map.iter().map(|e| e.value().clone()).collect()
        };

        rows.retain(|row| {
            if let Some(start) = start {
                if row.key() < start {
                    return false;
                }
            }
            if let Some(end) = end_exclusive {
                if row.key() >= end {
                    return false;
                }
            }
            true
        });
        rows.sort_by(|a, b| a.key().cmp(b.key()));
        Ok(rows)
    }

    /// Row count; 0 for a table this worker has never seen.
    pub fn count(&self, table: &str) -> usize {
        if is_persistent(table) {
            let table_dir = self.storage_dir.join(table);
            list_row_files(&table_dir).map(|f| f.len()).unwrap_or(0)
        } else {
            self.tables.get(table).map(|t| t.len()).unwrap_or(0)
        }
    }

    /// All table names this worker holds, ephemeral and persistent, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        if let Ok(entries) = fs::read_dir(&self.storage_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if entry.path().is_dir() && name.starts_with(PERSISTENT_PREFIX) {
                    names.push(name);
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// (row key, content hash) pairs for anti-entropy, sorted by key.
    pub fn row_digests(&self, table: &str) -> Vec<(String, String)> {
        let rows = match self.scan(table, None, None) {
            Ok(rows) => rows,
            Err(_) => return Vec::new(),
        };
        rows.iter()
            .map(|row| (row.key().to_string(), super::replication::hash_row(row)))
            .collect()
    }
}

fn list_row_files(table_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(table_dir)?.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        if path.is_file() {
            files.push(path);
        } else if path.is_dir() && name.starts_with('_') {
            for nested in fs::read_dir(&path)?.flatten() {
                let nested_path = nested.path();
                let nested_name = nested.file_name().to_string_lossy().to_string();
                if nested_path.is_file() && !nested_name.starts_with('.') {
                    files.push(nested_path);
                }
            }
        }
    }
    Ok(files)
}
