pub mod context;
pub mod coordinator;
pub mod jobs;
pub mod ops;
pub mod partitioner;
pub mod protocol;
pub mod rdd;
pub mod worker;

#[cfg(test)]
mod tests;

pub use context::FlameContext;
pub use jobs::JobRegistry;
pub use ops::FnRegistry;
pub use partitioner::{Partition, Partitioner};
pub use rdd::{PairRdd, Rdd};
