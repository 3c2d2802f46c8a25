//! Sharded Key-Value Store + Flame Compute Layer
//!
//! This library crate defines the core modules of the platform. It serves as
//! the foundation for the four role binaries (`kvs-coordinator`, `kvs-worker`,
//! `flame-coordinator`, `flame-worker`).
//!
//! ## Architecture Modules
//! The system is composed of three loosely coupled subsystems:
//!
//! - **`liveness`**: The cluster coordination layer. A TTL-based heartbeat
//!   registry shared by both coordinators, plus the worker-side ping loop.
//! - **`kvs`**: The distributed state layer. Row/table storage (ephemeral and
//!   disk-backed), the routing client with streaming range scans, and the
//!   background replication manager.
//! - **`flame`**: The compute layer. Partition planning over the KVS ring,
//!   the operator registry executed by flame workers, and the eager
//!   Context/RDD/PairRDD dispatch facade.

pub mod error;
pub mod flame;
pub mod kvs;
pub mod liveness;

pub use error::{Error, Result};
