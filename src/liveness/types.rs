use serde::{Deserialize, Serialize};

/// A registered worker as reported by `/workers`: opaque ID plus `ip:port`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: String,
    pub address: String,
}

/// Query parameters for `GET /ping`. Both are required; they are optional
/// here so the handler can answer 400 with a message instead of a generic
/// extractor rejection.
#[derive(Debug, Deserialize)]
pub struct PingParams {
    pub id: Option<String>,
    pub port: Option<String>,
}
