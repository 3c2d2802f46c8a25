//! KVS wire protocol surface.
//!
//! Endpoint paths and query-parameter shapes shared by the worker handlers
//! and the routing client. Bodies are raw bytes (encoded rows or column
//! values), not JSON.

use serde::Deserialize;

/// Response header carrying the row version after a write or versioned read.
pub const VERSION_HEADER: &str = "version";

/// Full-row and cell data operations live under this prefix.
pub const ENDPOINT_DATA: &str = "/data";
/// Atomic table rename; body is the new name.
pub const ENDPOINT_RENAME: &str = "/rename";
/// Whole-table delete.
pub const ENDPOINT_DELETE: &str = "/delete";
/// Per-table row count.
pub const ENDPOINT_COUNT: &str = "/count";
/// Anti-entropy inventory: table names.
pub const ENDPOINT_REPL_TABLES: &str = "/repl/tables";
/// Anti-entropy inventory: row key + content hash lines per table.
pub const ENDPOINT_REPL_ROWS: &str = "/repl/rows";

/// Query parameters for a range scan (`GET /data/:table`).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanParams {
    pub start_row: Option<String>,
    pub end_row_exclusive: Option<String>,
}

/// Query parameters for a cell write (`PUT /data/:table/:row/:column`).
///
/// `ifcolumn`/`equals` request a conditional write; `replicated` marks a
/// write forwarded by a peer's replication manager so it is not forwarded
/// again.
#[derive(Debug, Deserialize)]
pub struct PutCellParams {
    pub ifcolumn: Option<String>,
    pub equals: Option<String>,
    #[serde(default)]
    pub replicated: bool,
}

/// Query parameters for a cell read (`GET /data/:table/:row/:column`).
#[derive(Debug, Deserialize)]
pub struct GetCellParams {
    pub version: Option<u32>,
}

/// Query parameters for the paginated table view.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewParams {
    pub from_row: Option<String>,
}

/// Percent-encodes a path/query component; unreserved characters pass
/// through.
pub fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
