//! Iterative coordinator.
//!
//! Activated when the crew declares a positive `max_iterations`.  Cycles are
//! legal here: the task order comes from the cycle-tolerant
//! [`linearize`](crate::cadre::graph::TaskGraph::linearize), and each
//! iteration feeds the previous iteration's outputs into every task before
//! re-running the whole list.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::json;

use crate::cadre::coordinator::{
    leaf_outputs, run_task, Coordinator, ErrorStrategy, RunContext,
};
use crate::cadre::error::CadreError;
use crate::cadre::event::{Event, EventType};
use crate::cadre::task::propagates;

/// Fixed-bound loop over a (possibly cyclic) graph.
pub struct IterativeCoordinator {
    max_iterations: usize,
    strategy: ErrorStrategy,
}

impl IterativeCoordinator {
    /// `max_iterations` must be positive; the crew validates the upper bound.
    pub fn new(max_iterations: usize, strategy: ErrorStrategy) -> Self {
        Self {
            max_iterations,
            strategy,
        }
    }
}

#[async_trait]
impl Coordinator for IterativeCoordinator {
    async fn execute(
        &self,
        ctx: &RunContext,
    ) -> Result<HashMap<String, serde_json::Value>, CadreError> {
        let order = ctx.graph.linearize();
        let mut carry: HashMap<String, serde_json::Value> = ctx
            .inputs
            .iter()
            .filter(|(k, _)| propagates(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut accumulated_errors: Vec<String> = Vec::new();

        ctx.state
            .set_metadata("max_iterations", json!(self.max_iterations))
            .await?;

        for iteration in 1..=self.max_iterations {
            if ctx.cancel.is_cancelled() {
                return Err(CadreError::Cancelled);
            }
            ctx.state
                .set_metadata("current_iteration", json!(iteration))
                .await?;
            ctx.bus
                .emit(
                    &Event::new(EventType::IterationStarted)
                        .with("run_id", ctx.run_id.clone())
                        .with("iteration", iteration as u64),
                )
                .await?;

            // the previous iteration's outputs (run inputs on the first) are
            // merged into every task before anything runs
            for task in &order {
                task.merge_inputs(&carry);
            }

            for task in &order {
                match run_task(ctx, &ctx.cancel, task).await {
                    Ok(()) => {}
                    Err(err) if err.is_cancellation() => return Err(err),
                    Err(err) => match self.strategy {
                        ErrorStrategy::ContinueAll => {
                            accumulated_errors.push(format!(
                                "iteration {} task '{}': {}",
                                iteration, task.name, err
                            ));
                        }
                        // complete-running degenerates to fail-fast here: the
                        // loop runs one task at a time, so nothing is in flight
                        ErrorStrategy::FailFast | ErrorStrategy::CompleteRunning => {
                            return Err(err)
                        }
                    },
                }
            }

            // snapshot this iteration's outputs for the next one
            carry = HashMap::new();
            for task in &order {
                for (key, value) in task.propagated_outputs() {
                    carry.insert(key, value);
                }
            }

            ctx.bus
                .emit(
                    &Event::new(EventType::IterationCompleted)
                        .with("run_id", ctx.run_id.clone())
                        .with("iteration", iteration as u64),
                )
                .await?;

            if iteration < self.max_iterations {
                for task in &order {
                    task.reset();
                }
            }
        }

        if !accumulated_errors.is_empty() {
            return Err(CadreError::state(format!(
                "iterative run finished with {} task failure(s): {}",
                accumulated_errors.len(),
                accumulated_errors.join("; ")
            )));
        }

        // a fully cyclic graph has no leaves; the final iteration's snapshot
        // is then the run's outputs
        let outputs = leaf_outputs(&ctx.graph);
        if outputs.is_empty() {
            Ok(carry)
        } else {
            Ok(outputs)
        }
    }
}
