//! Process coordinators.
//!
//! The four process disciplines (sequential, parallel, hierarchical,
//! iterative) are behavioural variants over the same task graph.  Each
//! implements [`Coordinator`] and receives a [`RunContext`] bundling the
//! graph, the agent runtimes, the executor, the state manager, and the event
//! bus.  Coordinators own all task mutation for their run; nothing else
//! writes to the graph while a run is in flight.

pub mod hierarchical;
pub mod iterative;
pub mod parallel;
pub mod sequential;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cadre::error::CadreError;
use crate::cadre::event::{Event, EventBus, EventType};
use crate::cadre::executor::TaskExecutor;
use crate::cadre::graph::TaskGraph;
use crate::cadre::runtime::AgentRuntime;
use crate::cadre::state::StateManager;
use crate::cadre::task::{Task, TaskStatus};

pub use hierarchical::HierarchicalCoordinator;
pub use iterative::IterativeCoordinator;
pub use parallel::ParallelCoordinator;
pub use sequential::SequentialCoordinator;

/// How a coordinator reacts to a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    /// Cancel in-flight work on the first failure (the default).
    FailFast,
    /// Stop seeding new tasks but let in-flight tasks finish.
    ///
    /// In iterative mode this behaves exactly like fail-fast: the iteration
    /// loop runs one task at a time, so there is never in-flight work to
    /// drain.
    CompleteRunning,
    /// Keep going until the graph is complete or every remaining task is
    /// blocked by failures; the surfaced error is the first failure seen.
    ContinueAll,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        ErrorStrategy::FailFast
    }
}

/// Everything a coordinator needs for one run.
#[derive(Clone)]
pub struct RunContext {
    /// Id of the run being driven.
    pub run_id: String,
    /// Cancellation root for the run.
    pub cancel: CancellationToken,
    /// The task graph (already validated).
    pub graph: Arc<TaskGraph>,
    /// One runtime per agent, keyed by agent name.
    pub runtimes: HashMap<String, Arc<AgentRuntime>>,
    /// Single-task executor.
    pub executor: Arc<TaskExecutor>,
    /// Durable state recorder.
    pub state: Arc<StateManager>,
    /// Lifecycle event fan-out.
    pub bus: Arc<EventBus>,
    /// Run inputs as provided by the caller.
    pub inputs: HashMap<String, serde_json::Value>,
}

impl RunContext {
    /// Runtime for the agent assigned to `task`.
    pub fn runtime_for(&self, task: &Task) -> Result<Arc<AgentRuntime>, CadreError> {
        self.runtimes
            .get(&task.agent)
            .cloned()
            .ok_or_else(|| {
                CadreError::config(format!(
                    "task '{}' references unknown agent '{}'",
                    task.name, task.agent
                ))
            })
    }
}

/// A process discipline driving one run to completion.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Drive the graph, returning the final run outputs.
    async fn execute(
        &self,
        ctx: &RunContext,
    ) -> Result<HashMap<String, serde_json::Value>, CadreError>;
}

/// Copy every propagating output of every completed dependency into the
/// task's inputs.  Dependencies are visited in declaration order, so later
/// dependencies overwrite earlier ones on key collision.
pub(crate) fn propagate_dependency_outputs(graph: &TaskGraph, task: &Task) {
    for dep_name in &task.depends_on {
        if let Some(dep) = graph.get(dep_name) {
            if dep.status() == TaskStatus::Completed {
                task.merge_inputs(&dep.propagated_outputs());
            }
        }
    }
}

/// Union of outputs across leaf tasks (tasks with no dependents), visited in
/// ascending name order so later leaves win on key collision.
pub(crate) fn leaf_outputs(graph: &TaskGraph) -> HashMap<String, serde_json::Value> {
    let mut outputs = HashMap::new();
    for leaf in graph.leaves() {
        for (key, value) in leaf.outputs() {
            outputs.insert(key, value);
        }
    }
    outputs
}

/// Run one task end to end: propagate dependency outputs, emit
/// `task.started`, execute, record state, and emit the terminal event.
///
/// A blocking-hook error aborts before execution, as does cancellation.
pub(crate) async fn run_task(
    ctx: &RunContext,
    cancel: &CancellationToken,
    task: &Arc<Task>,
) -> Result<(), CadreError> {
    propagate_dependency_outputs(&ctx.graph, task);
    let runtime = ctx.runtime_for(task)?;

    ctx.state
        .update_task_state(&task.name, TaskStatus::Running, None, None)
        .await?;
    ctx.bus
        .emit(
            &Event::new(EventType::TaskStarted)
                .with("run_id", ctx.run_id.clone())
                .with("task", task.name.clone())
                .with("agent", task.agent.clone()),
        )
        .await?;

    match ctx.executor.execute(cancel, task, &runtime).await {
        Ok(()) => {
            ctx.state
                .update_task_state(
                    &task.name,
                    TaskStatus::Completed,
                    Some(task.outputs()),
                    None,
                )
                .await?;
            ctx.bus
                .emit(
                    &Event::new(EventType::TaskCompleted)
                        .with("run_id", ctx.run_id.clone())
                        .with("task", task.name.clone())
                        .with("agent", task.agent.clone()),
                )
                .await?;
            Ok(())
        }
        Err(err) => {
            ctx.state
                .update_task_state(
                    &task.name,
                    TaskStatus::Failed,
                    None,
                    Some(err.to_string()),
                )
                .await?;
            ctx.bus
                .emit(
                    &Event::new(EventType::TaskFailed)
                        .with("run_id", ctx.run_id.clone())
                        .with("task", task.name.clone())
                        .with("agent", task.agent.clone())
                        .with("error", err.to_string()),
                )
                .await?;
            Err(err)
        }
    }
}
