pub mod registry;
pub mod types;

#[cfg(test)]
mod tests;

pub use registry::{spawn_ping_loop, LivenessRegistry, PING_INTERVAL, WORKER_TTL};
pub use types::WorkerInfo;
