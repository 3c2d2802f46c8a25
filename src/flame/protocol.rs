//! Flame dispatch protocol.
//!
//! Operator routes served by every Flame worker, and the query-parameter
//! envelope each dispatch carries. The request body is the registered
//! function name (or, for join/intersection, the other table name); code is
//! never shipped over the wire.

use serde::Deserialize;

pub const ROUTE_USE_JOB: &str = "/useJob";

pub const ROUTE_RDD_FLAT_MAP: &str = "/rdd/flatMap";
pub const ROUTE_RDD_FOR_EACH: &str = "/rdd/forEach";
pub const ROUTE_RDD_MAP_TO_PAIR: &str = "/rdd/mapToPair";
pub const ROUTE_RDD_FLAT_MAP_TO_PAIR: &str = "/rdd/flatMapToPair";
pub const ROUTE_RDD_INTERSECTION: &str = "/rdd/intersection";
pub const ROUTE_RDD_SAMPLE: &str = "/rdd/sample";
pub const ROUTE_RDD_GROUP_BY: &str = "/rdd/groupBy";
pub const ROUTE_RDD_DISTINCT: &str = "/rdd/distinct";
pub const ROUTE_RDD_FOLD: &str = "/rdd/fold";
pub const ROUTE_RDD_FILTER: &str = "/rdd/filter";
pub const ROUTE_CONTEXT_FROM_TABLE: &str = "/context/fromTable";
pub const ROUTE_PAIR_FOLD_BY_KEY: &str = "/pairRdd/foldByKey";
pub const ROUTE_PAIR_FLAT_MAP: &str = "/pairRdd/flatMap";
pub const ROUTE_PAIR_FLAT_MAP_TO_PAIR: &str = "/pairRdd/flatMapToPair";
pub const ROUTE_PAIR_JOIN: &str = "/pairRdd/join";
pub const ROUTE_PAIR_SAVE_AS_TABLE: &str = "/pairRdd/saveAsTable";
pub const ROUTE_PAIR_FOR_EACH_PAIR: &str = "/pairRdd/forEachPair";

/// Common query parameters for one operator dispatch. `from_key`/`to_key`
/// bound the scanned key sub-range; absent bounds mean unbounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpParams {
    pub input_table: String,
    pub output_table: Option<String>,
    pub kvs_coordinator: String,
    pub from_key: Option<String>,
    pub to_key: Option<String>,
    pub sampling_rate: Option<f64>,
    pub zero_element: Option<String>,
}

/// Query parameters for `POST /useJob`.
#[derive(Debug, Deserialize)]
pub struct UseJobParams {
    pub job: Option<String>,
}
