//! Eager RDD / PairRDD handles.
//!
//! A handle is a (table name, context) pair — never a lazy computation
//! graph. Every transformation immediately dispatches to the Flame workers
//! and returns a handle to a freshly named output table; the input table is
//! never mutated (rename via `save_as_table` is the only identity-changing
//! operation).

use crate::error::Result;
use crate::flame::context::FlameContext;
use crate::flame::protocol::*;

/// A distributed collection of strings, one per row under the `value`
/// column.
pub struct Rdd {
    table: String,
    ctx: FlameContext,
}

impl std::fmt::Debug for Rdd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rdd").field("table", &self.table).finish()
    }
}

impl Rdd {
    pub fn new(table: String, ctx: FlameContext) -> Self {
        Self { table, ctx }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub async fn count(&self) -> Result<usize> {
        self.ctx.kvs().count(&self.table).await
    }

    pub async fn collect(&self) -> Result<Vec<String>> {
        let mut scan = self.ctx.kvs().scan(&self.table, None, None).await?;
        let mut values = Vec::new();
        while let Some(row) = scan.next_row().await? {
            if let Some(value) = row.get("value") {
                values.push(value.to_string());
            }
        }
        Ok(values)
    }

    /// Up to `n` elements, in scan order.
    pub async fn take(&self, n: usize) -> Result<Vec<String>> {
        let mut scan = self.ctx.kvs().scan(&self.table, None, None).await?;
        let mut values = Vec::new();
        while values.len() < n {
            match scan.next_row().await? {
                Some(row) => {
                    if let Some(value) = row.get("value") {
                        values.push(value.to_string());
                    }
                }
                None => break,
            }
        }
        Ok(values)
    }

    /// Renames the backing table; atomic at the storage layer. Workers that
    /// never held rows for the table answer 404 and are tolerated.
    pub async fn save_as_table(&mut self, name: &str) -> Result<()> {
        if !self.ctx.kvs().rename(&self.table, name).await? {
            tracing::warn!(
                "rename of '{}' to '{}' was not acknowledged by every worker",
                self.table,
                name
            );
        }
        self.table = name.to_string();
        Ok(())
    }

    pub async fn flat_map(&self, function: &str) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_FLAT_MAP,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    /// `flat_map` into a persistent (`pt-`) output table.
    pub async fn flat_map_to_pt(&self, function: &str) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_FLAT_MAP,
                function.as_bytes().to_vec(),
                &[],
                true,
            )
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    pub async fn map_to_pair(&self, function: &str) -> Result<PairRdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_MAP_TO_PAIR,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(PairRdd::new(output, self.ctx.clone()))
    }

    pub async fn flat_map_to_pair(&self, function: &str) -> Result<PairRdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_FLAT_MAP_TO_PAIR,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(PairRdd::new(output, self.ctx.clone()))
    }

    /// Elements present in both this RDD and `other`, deduplicated.
    pub async fn intersection(&self, other: &Rdd) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_INTERSECTION,
                other.table.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    /// Bernoulli sample: each element is kept with probability `rate`.
    pub async fn sample(&self, rate: f64) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_SAMPLE,
                Vec::new(),
                &[("samplingRate", rate.to_string())],
                false,
            )
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    pub async fn group_by(&self, function: &str) -> Result<PairRdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_GROUP_BY,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(PairRdd::new(output, self.ctx.clone()))
    }

    /// Duplicates collapse because each value becomes its own row key in the
    /// output table.
    pub async fn distinct(&self) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(&self.table, None, ROUTE_RDD_DISTINCT, Vec::new(), &[], false)
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    pub async fn filter(&self, predicate: &str) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_FILTER,
                predicate.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    /// Reduces the whole RDD to one value: each partition folds locally and
    /// returns its partial accumulator; the partials are then combined
    /// sequentially here with the same function, seeded with `zero`.
    pub async fn fold(&self, zero: &str, function: &str) -> Result<String> {
        let partials = self
            .ctx
            .invoke_fold_operation(
                &self.table,
                ROUTE_RDD_FOLD,
                function.as_bytes().to_vec(),
                &[("zeroElement", zero.to_string())],
            )
            .await?;
        let combine = self.ctx.functions().combine(function)?;
        let mut acc = zero.to_string();
        for partial in partials {
            acc = combine(&acc, &partial);
        }
        Ok(acc)
    }

    /// Runs the named side-effect function on every element.
    pub async fn for_each(&self, function: &str) -> Result<()> {
        self.ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_RDD_FOR_EACH,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(())
    }
}

/// A distributed collection of (key, value) pairs: the row key is the pair
/// key and every column holds one value for it.
pub struct PairRdd {
    table: String,
    ctx: FlameContext,
}

impl PairRdd {
    pub fn new(table: String, ctx: FlameContext) -> Self {
        Self { table, ctx }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    pub async fn collect(&self) -> Result<Vec<(String, String)>> {
        let mut scan = self.ctx.kvs().scan(&self.table, None, None).await?;
        let mut pairs = Vec::new();
        while let Some(row) = scan.next_row().await? {
            for column in row.columns() {
                if let Some(value) = row.get(column) {
                    pairs.push((row.key().to_string(), value.to_string()));
                }
            }
        }
        Ok(pairs)
    }

    /// Number of pairs (column values), not rows.
    pub async fn count(&self) -> Result<usize> {
        let mut scan = self.ctx.kvs().scan(&self.table, None, None).await?;
        let mut count = 0;
        while let Some(row) = scan.next_row().await? {
            count += row.column_count();
        }
        Ok(count)
    }

    /// Folds every key's values into one, seeding each key's accumulator
    /// with `zero`.
    pub async fn fold_by_key(&self, zero: &str, function: &str) -> Result<PairRdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_PAIR_FOLD_BY_KEY,
                function.as_bytes().to_vec(),
                &[("zeroElement", zero.to_string())],
                false,
            )
            .await?;
        Ok(PairRdd::new(output, self.ctx.clone()))
    }

    pub async fn flat_map(&self, function: &str) -> Result<Rdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_PAIR_FLAT_MAP,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(Rdd::new(output, self.ctx.clone()))
    }

    pub async fn flat_map_to_pair(&self, function: &str) -> Result<PairRdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_PAIR_FLAT_MAP_TO_PAIR,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(PairRdd::new(output, self.ctx.clone()))
    }

    /// Inner join on the row key; every value combination becomes one
    /// `value1,value2` pair.
    pub async fn join(&self, other: &PairRdd) -> Result<PairRdd> {
        let output = self
            .ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_PAIR_JOIN,
                other.table.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(PairRdd::new(output, self.ctx.clone()))
    }

    /// Distributed copy into `name`, flattening every pair value into a
    /// `value` column row.
    pub async fn save_as_table(&mut self, name: &str) -> Result<()> {
        self.ctx
            .invoke_operation(
                &self.table,
                Some(name),
                ROUTE_PAIR_SAVE_AS_TABLE,
                Vec::new(),
                &[],
                false,
            )
            .await?;
        self.table = name.to_string();
        Ok(())
    }

    /// Runs the named side-effect function on every pair.
    pub async fn for_each_pair(&self, function: &str) -> Result<()> {
        self.ctx
            .invoke_operation(
                &self.table,
                None,
                ROUTE_PAIR_FOR_EACH_PAIR,
                function.as_bytes().to_vec(),
                &[],
                false,
            )
            .await?;
        Ok(())
    }
}
