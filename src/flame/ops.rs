//! Named-function registry for Flame operators.
//!
//! User transformations are never shipped as serialized code: the dispatch
//! body carries a function *name*, and every Flame worker resolves it from
//! this registry. Jobs therefore ship with their functions compiled in and
//! registered on every worker binary. Each operator kind has its own typed
//! table so a name can only resolve to a function of the right shape.

use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::kvs::row::Row;

/// SHA-256 hex digest used to synthesize unique row keys and column names.
pub fn hash_key(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub type FlatMapFn = Arc<dyn Fn(&str) -> Vec<String> + Send + Sync>;
pub type MapToPairFn = Arc<dyn Fn(&str) -> Option<(String, String)> + Send + Sync>;
pub type FlatMapToPairFn = Arc<dyn Fn(&str) -> Vec<(String, String)> + Send + Sync>;
pub type PairFlatMapFn = Arc<dyn Fn(&str, &str) -> Vec<String> + Send + Sync>;
pub type PairFlatMapToPairFn = Arc<dyn Fn(&str, &str) -> Vec<(String, String)> + Send + Sync>;
pub type KeyByFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;
pub type CombineFn = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;
pub type RowToStringFn = Arc<dyn Fn(&Row) -> Option<String> + Send + Sync>;
pub type SideEffectFn = Arc<dyn Fn(&str) + Send + Sync>;
pub type PairSideEffectFn = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
pub struct FnRegistry {
    flat_map: DashMap<String, FlatMapFn>,
    map_to_pair: DashMap<String, MapToPairFn>,
    flat_map_to_pair: DashMap<String, FlatMapToPairFn>,
    pair_flat_map: DashMap<String, PairFlatMapFn>,
    pair_flat_map_to_pair: DashMap<String, PairFlatMapToPairFn>,
    key_by: DashMap<String, KeyByFn>,
    predicate: DashMap<String, PredicateFn>,
    combine: DashMap<String, CombineFn>,
    row_to_string: DashMap<String, RowToStringFn>,
    side_effect: DashMap<String, SideEffectFn>,
    pair_side_effect: DashMap<String, PairSideEffectFn>,
}

fn unknown(kind: &str, name: &str) -> Error {
    Error::BadSubmission(format!(
        "unknown {kind} function '{name}' — it must be registered on every flame worker"
    ))
}

impl FnRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_flat_map<F>(&self, name: &str, f: F)
    where
        F: Fn(&str) -> Vec<String> + Send + Sync + 'static,
    {
        self.flat_map.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_map_to_pair<F>(&self, name: &str, f: F)
    where
        F: Fn(&str) -> Option<(String, String)> + Send + Sync + 'static,
    {
        self.map_to_pair.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_flat_map_to_pair<F>(&self, name: &str, f: F)
    where
        F: Fn(&str) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.flat_map_to_pair.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_pair_flat_map<F>(&self, name: &str, f: F)
    where
        F: Fn(&str, &str) -> Vec<String> + Send + Sync + 'static,
    {
        self.pair_flat_map.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_pair_flat_map_to_pair<F>(&self, name: &str, f: F)
    where
        F: Fn(&str, &str) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.pair_flat_map_to_pair
            .insert(name.to_string(), Arc::new(f));
    }

    pub fn register_key_by<F>(&self, name: &str, f: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.key_by.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_predicate<F>(&self, name: &str, f: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.predicate.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_combine<F>(&self, name: &str, f: F)
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        self.combine.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_row_to_string<F>(&self, name: &str, f: F)
    where
        F: Fn(&Row) -> Option<String> + Send + Sync + 'static,
    {
        self.row_to_string.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_side_effect<F>(&self, name: &str, f: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.side_effect.insert(name.to_string(), Arc::new(f));
    }

    pub fn register_pair_side_effect<F>(&self, name: &str, f: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.pair_side_effect.insert(name.to_string(), Arc::new(f));
    }

    pub fn flat_map(&self, name: &str) -> Result<FlatMapFn> {
        self.flat_map
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("flatMap", name))
    }

    pub fn map_to_pair(&self, name: &str) -> Result<MapToPairFn> {
        self.map_to_pair
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("mapToPair", name))
    }

    pub fn flat_map_to_pair(&self, name: &str) -> Result<FlatMapToPairFn> {
        self.flat_map_to_pair
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("flatMapToPair", name))
    }

    pub fn pair_flat_map(&self, name: &str) -> Result<PairFlatMapFn> {
        self.pair_flat_map
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("pair flatMap", name))
    }

    pub fn pair_flat_map_to_pair(&self, name: &str) -> Result<PairFlatMapToPairFn> {
        self.pair_flat_map_to_pair
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("pair flatMapToPair", name))
    }

    pub fn key_by(&self, name: &str) -> Result<KeyByFn> {
        self.key_by
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("groupBy", name))
    }

    pub fn predicate(&self, name: &str) -> Result<PredicateFn> {
        self.predicate
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("filter", name))
    }

    pub fn combine(&self, name: &str) -> Result<CombineFn> {
        self.combine
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("fold", name))
    }

    pub fn row_to_string(&self, name: &str) -> Result<RowToStringFn> {
        self.row_to_string
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("fromTable", name))
    }

    pub fn side_effect(&self, name: &str) -> Result<SideEffectFn> {
        self.side_effect
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("forEach", name))
    }

    pub fn pair_side_effect(&self, name: &str) -> Result<PairSideEffectFn> {
        self.pair_side_effect
            .get(name)
            .map(|f| f.clone())
            .ok_or_else(|| unknown("forEachPair", name))
    }
}

/// Functions shipped with the platform binaries. Every flame worker and
/// coordinator registers these so job submissions can resolve them anywhere.
pub fn register_builtins(registry: &FnRegistry) {
    registry.register_flat_map("identity", |v| vec![v.to_string()]);
    registry.register_flat_map("split-whitespace", |v| {
        v.split_whitespace().map(|w| w.to_string()).collect()
    });
    registry.register_map_to_pair("word-one", |v| Some((v.to_string(), "1".to_string())));
    registry.register_flat_map_to_pair("word-one-pairs", |v| {
        v.split_whitespace()
            .map(|w| (w.to_string(), "1".to_string()))
            .collect()
    });
    registry.register_pair_flat_map("pair-value", |_k, v| vec![v.to_string()]);
    registry.register_pair_flat_map_to_pair("swap", |k, v| {
        vec![(v.to_string(), k.to_string())]
    });
    registry.register_key_by("first-char", |v| v.chars().next().map(|c| c.to_string()));
    registry.register_predicate("non-empty", |v| !v.trim().is_empty());
    registry.register_combine("sum", |a, b| {
        let a: i64 = a.trim().parse().unwrap_or(0);
        let b: i64 = b.trim().parse().unwrap_or(0);
        (a + b).to_string()
    });
    registry.register_combine("concat-comma", |a, b| {
        if a.is_empty() {
            b.to_string()
        } else {
            format!("{a},{b}")
        }
    });
    registry.register_row_to_string("value-column", |row| {
        row.get("value").map(|v| v.to_string())
    });
    registry.register_side_effect("log-value", |v| tracing::info!("forEach: {}", v));
    registry.register_pair_side_effect("log-pair", |k, v| {
        tracing::info!("forEachPair: ({}, {})", k, v)
    });
}
