//! Checkpointed fan-out shared by the versions and metadata phases.
//!
//! Work is cut into batches of `checkpoint_interval` node ids. Each batch is
//! run in groups of `concurrency` futures joined together under the batch
//! timeout, and the cache is saved after every batch.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::BuilderConfig;
use crate::errors::NodemapResult;

#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchPlan {
    pub checkpoint_interval: usize,
    pub concurrency: usize,
    pub node_timeout: Duration,
    pub batch_timeout: Duration,
}

impl From<&BuilderConfig> for BatchPlan {
    fn from(config: &BuilderConfig) -> Self {
        Self {
            checkpoint_interval: config.checkpoint_interval.max(1),
            concurrency: config.concurrency.max(1),
            node_timeout: config.node_timeout,
            batch_timeout: config.batch_timeout,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct BatchReport {
    pub batches: usize,
    pub groups_timed_out: usize,
    /// Nodes cut off by `node_timeout` or by their group's `batch_timeout`.
    pub nodes_timed_out: Vec<String>,
}

/// Fixed delay after a network call. Zero skips the timer entirely.
pub(crate) async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Run `work` over every id. `checkpoint` runs after each batch; its error
/// aborts the phase.
pub(crate) async fn run_batches<W, Fut, S>(
    phase: &str,
    ids: &[String],
    plan: BatchPlan,
    work: W,
    mut checkpoint: S,
) -> NodemapResult<BatchReport>
where
    W: Fn(String) -> Fut,
    Fut: Future<Output = ()>,
    S: FnMut() -> NodemapResult<()>,
{
    let mut report = BatchReport::default();
    if ids.is_empty() {
        return Ok(report);
    }

    let total_batches = ids.len().div_ceil(plan.checkpoint_interval);
    let mut processed = 0usize;

    for (index, batch) in ids.chunks(plan.checkpoint_interval).enumerate() {
        info!(
            "{phase}: batch {}/{} ({} nodes)",
            index + 1,
            total_batches,
            batch.len()
        );

        for group in batch.chunks(plan.concurrency) {
            let finished: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
            let finished_ref = &finished;
            let tasks = group.iter().map(|id| {
                let task = work(id.clone());
                let id = id.clone();
                let limit = plan.node_timeout;
                async move {
                    let outcome = tokio::time::timeout(limit, task).await;
                    finished_ref.lock().insert(id.clone());
                    match outcome {
                        Ok(()) => None,
                        Err(_) => Some(id),
                    }
                }
            });

            match tokio::time::timeout(plan.batch_timeout, join_all(tasks)).await {
                Ok(results) => {
                    for id in results.into_iter().flatten() {
                        warn!("{phase}: {id} timed out after {:?}", plan.node_timeout);
                        report.nodes_timed_out.push(id);
                    }
                }
                Err(_) => {
                    warn!(
                        "{phase}: group of {} nodes timed out after {:?}, continuing",
                        group.len(),
                        plan.batch_timeout
                    );
                    report.groups_timed_out += 1;
                    let finished = finished.lock();
                    for id in group.iter().filter(|id| !finished.contains(*id)) {
                        warn!("{phase}: {id} unfinished when its group timed out");
                        report.nodes_timed_out.push(id.clone());
                    }
                }
            }
        }

        processed += batch.len();
        checkpoint()?;
        report.batches += 1;
        info!("{phase}: checkpoint saved ({processed}/{} nodes)", ids.len());
    }

    Ok(report)
}
