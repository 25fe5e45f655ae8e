//! Sequential coordinator.
//!
//! Walks the topological order one task at a time, propagating each
//! dependency's outputs into its dependents just before execution.  A single
//! failure aborts the walk and fails the run.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::cadre::coordinator::{leaf_outputs, run_task, Coordinator, RunContext};
use crate::cadre::error::CadreError;

/// Topological walk; the default process discipline.
#[derive(Default)]
pub struct SequentialCoordinator;

impl SequentialCoordinator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Coordinator for SequentialCoordinator {
    async fn execute(
        &self,
        ctx: &RunContext,
    ) -> Result<HashMap<String, serde_json::Value>, CadreError> {
        for task in ctx.graph.topological_sort()? {
            if ctx.cancel.is_cancelled() {
                return Err(CadreError::Cancelled);
            }
            // resumed runs seed the graph with already-terminal tasks
            if task.status().is_terminal() {
                continue;
            }
            run_task(ctx, &ctx.cancel, &task).await?;
        }
        Ok(leaf_outputs(&ctx.graph))
    }
}
