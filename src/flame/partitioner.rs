//! Partition planning.
//!
//! Intersects the KVS shard ring with the live Flame worker set: one
//! partition per ring segment, including the wraparound segment for keys
//! below the first worker ID (served by the last ring member, matching the
//! routing client), each assigned to a Flame worker. The emitted ranges
//! always tile the whole key space with no gap or overlap.

use crate::error::{Error, Result};
use crate::kvs::client::WorkerEntry;

/// One key sub-range of one KVS worker, assigned to one Flame worker.
/// `None` bounds mean "unbounded" on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub from_key: Option<String>,
    pub to_key_exclusive: Option<String>,
    pub kvs_worker: String,
    pub flame_worker: String,
}

#[derive(Debug, Clone)]
struct KvsRange {
    address: String,
    from_key: Option<String>,
    to_key_exclusive: Option<String>,
}

#[derive(Debug, Default)]
pub struct Partitioner {
    kvs_ranges: Vec<KvsRange>,
    flame_workers: Vec<String>,
}

impl Partitioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_kvs_worker(
        &mut self,
        address: impl Into<String>,
        from_key: Option<String>,
        to_key_exclusive: Option<String>,
    ) {
        self.kvs_ranges.push(KvsRange {
            address: address.into(),
            from_key,
            to_key_exclusive,
        });
    }

    pub fn add_flame_worker(&mut self, address: impl Into<String>) {
        self.flame_workers.push(address.into());
    }

    /// Builds the ring segments from a sorted KVS worker list: worker `i`
    /// covers `[id_i, id_{i+1})`, the last worker additionally covers the
    /// unbounded tail and the wraparound below the first ID.
    pub fn from_ring(kvs_workers: &[WorkerEntry], flame_workers: &[String]) -> Self {
        let mut partitioner = Self::new();
        let n = kvs_workers.len();
        for (i, worker) in kvs_workers.iter().enumerate() {
            if i == n - 1 {
                partitioner.add_kvs_worker(&worker.address, Some(worker.id.clone()), None);
                partitioner.add_kvs_worker(
                    &worker.address,
                    None,
                    Some(kvs_workers[0].id.clone()),
                );
            } else {
                partitioner.add_kvs_worker(
                    &worker.address,
                    Some(worker.id.clone()),
                    Some(kvs_workers[i + 1].id.clone()),
                );
            }
        }
        for flame_worker in flame_workers {
            partitioner.add_flame_worker(flame_worker);
        }
        partitioner
    }

    /// Assigns each ring segment to a Flame worker, round-robin over the
    /// worker list sorted by address so the plan is reproducible for a given
    /// worker set. Errors — never an empty plan — when either set is empty.
    pub fn assign(&self) -> Result<Vec<Partition>> {
        if self.kvs_ranges.is_empty() {
            return Err(Error::BadRequest(
                "no KVS workers available for partitioning".into(),
            ));
        }
        if self.flame_workers.is_empty() {
            return Err(Error::BadRequest(
                "no Flame workers available for partitioning".into(),
            ));
        }

        let mut flame_workers = self.flame_workers.clone();
        flame_workers.sort();

        Ok(self
            .kvs_ranges
            .iter()
            .enumerate()
            .map(|(i, range)| Partition {
                from_key: range.from_key.clone(),
                to_key_exclusive: range.to_key_exclusive.clone(),
                kvs_worker: range.address.clone(),
                flame_worker: flame_workers[i % flame_workers.len()].clone(),
            })
            .collect())
    }
}
