//! Job registry.
//!
//! Maps job names to executable entry points. A submission names its job via
//! the `class` query parameter and the coordinator resolves it here — jobs
//! are compiled into the binaries, never loaded from submitted code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{Error, Result};
use crate::flame::context::FlameContext;

/// Thread-safe, asynchronous job entry point: a fresh context plus the
/// submission's argument list.
pub type JobFn = Arc<
    dyn Fn(FlameContext, Vec<String>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>>
        + Send
        + Sync,
>;

pub struct JobRegistry {
    jobs: DashMap<String, JobFn>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            jobs: DashMap::new(),
        })
    }

    pub fn register<F, Fut>(&self, name: &str, job: F)
    where
        F: Fn(FlameContext, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let job_fn: JobFn = Arc::new(move |ctx, args| {
            Box::pin(job(ctx, args)) as Pin<Box<dyn Future<Output = Result<()>> + Send>>
        });
        self.jobs.insert(name.to_string(), job_fn);
        tracing::info!("Registered job: {}", name);
    }

    pub async fn run(&self, name: &str, ctx: FlameContext, args: Vec<String>) -> Result<()> {
        let Some(job) = self.jobs.get(name).map(|j| j.clone()) else {
            return Err(Error::BadSubmission(format!(
                "double-check that the job '{name}' is registered with this coordinator \
                 and exposes a run(context, args) entry point"
            )));
        };
        job(ctx, args).await
    }

    pub fn has_job(&self, name: &str) -> bool {
        self.jobs.contains_key(name)
    }

    pub fn job_names(&self) -> Vec<String> {
        self.jobs.iter().map(|e| e.key().clone()).collect()
    }
}
