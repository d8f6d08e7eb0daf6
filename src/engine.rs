//! Execution engines
//!
//! An [`Engine`] evaluates a closed [`Plan`]. [`LocalEngine`] runs the steps one after the
//! other on the calling thread, [`TokioEngine`] runs every wavefront of independent steps
//! concurrently on a pool of blocking tokio workers.

use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinSet;
use tracing::{info_span, warn, Instrument};

use crate::buffer::Buffer;
use crate::graph::{Plan, Step};

pub trait Engine: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Number of steps that can be evaluated at the same time
    fn workers(&self) -> usize {
        1
    }

    fn realize(&self, plan: Arc<Plan>) -> anyhow::Result<Buffer>;
}

type Results = Vec<Option<Arc<Buffer>>>;

fn gather(results: &Results, step: &Step) -> anyhow::Result<Vec<Arc<Buffer>>> {
    step.deps()
        .iter()
        .map(|dep| {
            results
                .get(*dep)
                .and_then(Option::clone)
                .ok_or_else(|| anyhow!("input {dep} of {} is not available", step.name()))
        })
        .collect()
}

fn take_root(plan: &Plan, mut results: Results) -> anyhow::Result<Buffer> {
    let root = plan.root().ok_or_else(|| anyhow!("nothing to realize"))?;
    let buffer = results
        .get_mut(root)
        .and_then(Option::take)
        .ok_or_else(|| anyhow!("the result was not computed"))?;
    drop(results);
    Ok(Arc::try_unwrap(buffer).unwrap_or_else(|shared| shared.as_ref().clone()))
}

fn evaluate(step: &Step, inputs: &[Arc<Buffer>]) -> anyhow::Result<Buffer> {
    step.evaluate(inputs).map_err(|error| {
        warn!(step = step.name(), node = step.key(), %error, "step failed");
        error
    })
}

/// Sequential evaluation on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalEngine;

impl Engine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    fn realize(&self, plan: Arc<Plan>) -> anyhow::Result<Buffer> {
        let span = info_span!("realize", engine = "local", steps = plan.len());
        let _enter = span.enter();
        let mut results: Results = vec![None; plan.len()];
        for (position, step) in plan.steps().iter().enumerate() {
            let inputs = gather(&results, step)?;
            results[position] = Some(Arc::new(evaluate(step, &inputs)?));
        }
        take_root(&plan, results)
    }
}

/// Evaluates the plan inside the current tokio runtime
///
/// Steps of the same wavefront run concurrently as blocking tasks of a [`JoinSet`]. The
/// first failure aborts the steps of its wavefront that have not started yet.
pub async fn realize_async(plan: Arc<Plan>) -> anyhow::Result<Buffer> {
    let span = info_span!("realize", engine = "tokio", steps = plan.len());
    async move {
        let mut results: Results = vec![None; plan.len()];
        for front in plan.wavefronts() {
            let mut tasks = JoinSet::new();
            for position in front {
                let inputs = gather(&results, &plan.steps()[position])?;
                let plan = Arc::clone(&plan);
                tasks.spawn_blocking(move || {
                    evaluate(&plan.steps()[position], &inputs).map(|buffer| (position, buffer))
                });
            }
            while let Some(joined) = tasks.join_next().await {
                match joined.context("worker task failed").and_then(|result| result) {
                    Ok((position, buffer)) => results[position] = Some(Arc::new(buffer)),
                    Err(error) => {
                        if !tasks.is_empty() {
                            warn!(pending = tasks.len(), "aborting the rest of the wavefront");
                        }
                        tasks.abort_all();
                        return Err(error);
                    }
                }
            }
        }
        take_root(&plan, results)
    }
    .instrument(span)
    .await
}

/// Concurrent evaluation on a dedicated multi-threaded runtime
pub struct TokioEngine {
    runtime: Runtime,
    workers: usize,
}

impl fmt::Debug for TokioEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioEngine")
            .field("workers", &self.workers)
            .finish()
    }
}

impl TokioEngine {
    pub fn new(workers: usize) -> anyhow::Result<Self> {
        let workers = workers.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers)
            .thread_name("latfield-worker")
            .enable_all()
            .build()
            .context("building the tokio runtime")?;
        Ok(TokioEngine { runtime, workers })
    }
}

impl Engine for TokioEngine {
    fn name(&self) -> &str {
        "threaded"
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn realize(&self, plan: Arc<Plan>) -> anyhow::Result<Buffer> {
        if Handle::try_current().is_ok() {
            bail!("cannot block inside an async context, await realize_async instead");
        }
        self.runtime.block_on(realize_async(plan))
    }
}
