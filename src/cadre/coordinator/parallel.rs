//! Parallel coordinator.
//!
//! A fixed-size worker pool drains a task channel while the scheduler,
//! the coordinator's own future, owns the graph: it seeds the initially
//! ready tasks, re-consults readiness after every completion, and enqueues
//! each task at most once.
//!
//! Failure handling follows the configured [`ErrorStrategy`].  Workers
//! recover panics by transitioning the offending task to `failed` with a
//! synthesised error and forwarding it on the result channel, so a crashing
//! tool or hook can never wedge the pool.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, Mutex};

use crate::cadre::coordinator::{
    leaf_outputs, run_task, Coordinator, ErrorStrategy, RunContext,
};
use crate::cadre::error::CadreError;
use crate::cadre::task::{Task, TaskStatus};

/// Resolve the worker count: `0` means the CPU count, and the result is
/// clamped to `[1, task_count]`.
pub(crate) fn resolve_concurrency(configured: usize, task_count: usize) -> usize {
    let base = if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        configured
    };
    base.clamp(1, task_count.max(1))
}

/// Bounded worker pool over the dependency graph.
pub struct ParallelCoordinator {
    concurrency: usize,
    strategy: ErrorStrategy,
}

impl ParallelCoordinator {
    /// `concurrency` of zero resolves to the CPU count at execution time.
    pub fn new(concurrency: usize, strategy: ErrorStrategy) -> Self {
        Self {
            concurrency,
            strategy,
        }
    }
}

#[async_trait]
impl Coordinator for ParallelCoordinator {
    async fn execute(
        &self,
        ctx: &RunContext,
    ) -> Result<HashMap<String, serde_json::Value>, CadreError> {
        let task_count = ctx.graph.len();
        if task_count == 0 {
            return Ok(HashMap::new());
        }
        let workers = resolve_concurrency(self.concurrency, task_count);
        let child = ctx.cancel.child_token();

        // every task is queued at most once, so task_count bounds both channels
        let (task_tx, task_rx) = mpsc::channel::<Arc<Task>>(task_count);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) =
            mpsc::channel::<(String, Result<(), CadreError>)>(task_count);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let ctx = ctx.clone();
            let cancel = child.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = { task_rx.lock().await.recv().await };
                    let Some(task) = next else { break };
                    let outcome = AssertUnwindSafe(run_task(&ctx, &cancel, &task))
                        .catch_unwind()
                        .await;
                    let result = match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            let message = format!("task '{}' panicked in worker", task.name);
                            log::error!("{}", message);
                            if task.status() == TaskStatus::Running {
                                let _ = task.fail(message.clone());
                            }
                            let _ = ctx
                                .state
                                .update_task_state(
                                    &task.name,
                                    TaskStatus::Failed,
                                    None,
                                    Some(message.clone()),
                                )
                                .await;
                            Err(CadreError::state(message))
                        }
                    };
                    if result_tx.send((task.name.clone(), result)).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut queued: HashSet<String> = HashSet::new();
        let mut outstanding = 0usize;
        let mut first_error: Option<CadreError> = None;
        let mut seeding = true;

        for task in ctx.graph.get_ready() {
            queued.insert(task.name.clone());
            if task_tx.send(task).await.is_ok() {
                outstanding += 1;
            }
        }

        while outstanding > 0 {
            let Some((_name, result)) = result_rx.recv().await else {
                break;
            };
            outstanding -= 1;

            if let Err(err) = result {
                if first_error.is_none() {
                    first_error = Some(err);
                }
                match self.strategy {
                    ErrorStrategy::FailFast => {
                        // halt in-flight tasks and stop seeding
                        child.cancel();
                        seeding = false;
                    }
                    ErrorStrategy::CompleteRunning => {
                        seeding = false;
                    }
                    ErrorStrategy::ContinueAll => {}
                }
            }

            if seeding {
                for task in ctx.graph.get_ready() {
                    if queued.insert(task.name.clone()) && task_tx.send(task).await.is_ok() {
                        outstanding += 1;
                    }
                }
            }
        }

        // close the queue and drain the pool
        drop(task_tx);
        for handle in handles {
            let _ = handle.await;
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(leaf_outputs(&ctx.graph)),
        }
    }
}
