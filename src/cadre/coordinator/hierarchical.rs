//! Hierarchical coordinator.
//!
//! Control flow is expressed through the manager agent itself: three
//! synthetic tools (`delegate_task`, `check_status`, `provide_feedback`)
//! are injected into the manager's runtime, and the manager's single
//! (long) turn drives the whole run.  The tools close over an explicit
//! shared context rather than globals so coordinators can be constructed in
//! isolation for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::cadre::coordinator::{
    leaf_outputs, propagate_dependency_outputs, Coordinator, RunContext,
};
use crate::cadre::error::CadreError;
use crate::cadre::event::{Event, EventType};
use crate::cadre::task::{TaskStatus, MANAGER_PREFIX};
use crate::cadre::tool::Tool;

/// The manager makes one tool call per delegation plus status checks, so its
/// loop needs far more headroom than a worker agent.
const MANAGER_MAX_ITERATIONS: usize = 50;

/// Manager-driven process discipline.
pub struct HierarchicalCoordinator {
    manager: String,
    timeout: Option<Duration>,
}

impl HierarchicalCoordinator {
    /// `manager` must name an agent in the crew.
    pub fn new(manager: impl Into<String>) -> Self {
        Self {
            manager: manager.into(),
            timeout: None,
        }
    }

    /// Apply a crew-level deadline to the manager's turn (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn seed_prompt(&self, ctx: &RunContext) -> String {
        let mut prompt = format!(
            "You are coordinating run {} as the crew manager. Delegate every task to \
             completion using your tools.\n\nAvailable agents:",
            ctx.run_id
        );
        let mut agent_names: Vec<&String> = ctx.runtimes.keys().collect();
        agent_names.sort();
        for name in agent_names {
            if name == &self.manager {
                continue;
            }
            let runtime = &ctx.runtimes[name];
            let agent = runtime.agent();
            let tools = if agent.tools.is_empty() {
                "none".to_string()
            } else {
                agent.tools.join(", ")
            };
            prompt.push_str(&format!("\n- {} ({}) [tools: {}]", name, agent.role, tools));
        }

        prompt.push_str("\n\nTasks:");
        for task in ctx.graph.tasks() {
            let deps = if task.depends_on.is_empty() {
                "none".to_string()
            } else {
                task.depends_on.join(", ")
            };
            prompt.push_str(&format!(
                "\n- {}: {} (suggested agent: {}; depends on: {})",
                task.name, task.description, task.agent, deps
            ));
        }

        let ready: Vec<String> = ctx
            .graph
            .get_ready()
            .into_iter()
            .map(|t| t.name.clone())
            .collect();
        prompt.push_str(&format!("\n\nCurrently ready: {}", ready.join(", ")));
        prompt.push_str(
            "\n\nUse delegate_task to run one task at a time (dependencies must be completed \
             first), check_status to inspect progress, and provide_feedback to leave notes on a \
             task. You may assign a task to a different agent than suggested. If a task fails \
             and has retries remaining you may delegate it again. End your turn only when every \
             task is completed.",
        );
        prompt
    }
}

#[async_trait]
impl Coordinator for HierarchicalCoordinator {
    async fn execute(
        &self,
        ctx: &RunContext,
    ) -> Result<HashMap<String, serde_json::Value>, CadreError> {
        let manager_runtime = ctx.runtimes.get(&self.manager).cloned().ok_or_else(|| {
            CadreError::config(format!(
                "manager agent '{}' is not part of the crew",
                self.manager
            ))
        })?;

        let shared = Arc::new(ctx.clone());
        let mut tools: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        tools.insert(
            "delegate_task".to_string(),
            Arc::new(DelegateTaskTool {
                shared: Arc::clone(&shared),
            }),
        );
        tools.insert(
            "check_status".to_string(),
            Arc::new(CheckStatusTool {
                shared: Arc::clone(&shared),
            }),
        );
        tools.insert(
            "provide_feedback".to_string(),
            Arc::new(ProvideFeedbackTool {
                shared: Arc::clone(&shared),
            }),
        );
        manager_runtime.add_tools(tools).await;
        manager_runtime
            .set_max_iterations(manager_runtime.max_iterations().max(MANAGER_MAX_ITERATIONS));

        let prompt = self.seed_prompt(ctx);
        let turn = manager_runtime.execute(&ctx.cancel, &prompt);
        match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, turn).await {
                Ok(result) => result?,
                Err(_) => return Err(CadreError::DeadlineExceeded),
            },
            None => turn.await?,
        };

        let mut incomplete: Vec<String> = ctx
            .graph
            .tasks()
            .into_iter()
            .filter(|task| task.status() != TaskStatus::Completed)
            .map(|task| task.name.clone())
            .collect();
        if !incomplete.is_empty() {
            incomplete.sort();
            return Err(CadreError::state(format!(
                "manager turn ended with incomplete tasks: {}",
                incomplete.join(", ")
            )));
        }
        Ok(leaf_outputs(&ctx.graph))
    }
}

/// `delegate_task(task_name, agent_name, instructions?)`.
struct DelegateTaskTool {
    shared: Arc<RunContext>,
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        "delegate_task"
    }

    fn description(&self) -> &str {
        "Delegate one task to an agent and run it to completion. Dependencies must already be completed."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task_name": {"type": "string", "description": "Name of the task to run"},
                "agent_name": {"type": "string", "description": "Agent that should run it"},
                "instructions": {"type": "string", "description": "Optional extra instructions"}
            },
            "required": ["task_name", "agent_name"]
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let ctx = &self.shared;
        let task_name = input["task_name"]
            .as_str()
            .ok_or_else(|| CadreError::tool("delegate_task", "missing 'task_name'"))?;
        let agent_name = input["agent_name"]
            .as_str()
            .ok_or_else(|| CadreError::tool("delegate_task", "missing 'agent_name'"))?;
        let instructions = input["instructions"].as_str();

        let task = ctx.graph.get(task_name).ok_or_else(|| {
            CadreError::tool("delegate_task", format!("unknown task '{}'", task_name))
        })?;
        let runtime = ctx.runtimes.get(agent_name).cloned().ok_or_else(|| {
            CadreError::tool("delegate_task", format!("unknown agent '{}'", agent_name))
        })?;

        match task.status() {
            TaskStatus::Pending => {}
            TaskStatus::Failed if task.attempts() < task.retry.max_attempts => {
                task.rearm();
            }
            status => {
                return Err(CadreError::tool(
                    "delegate_task",
                    format!(
                        "task '{}' is {} and cannot be delegated",
                        task_name,
                        status.as_str()
                    ),
                ));
            }
        }

        let blocking: Vec<String> = task
            .depends_on
            .iter()
            .filter(|dep| {
                ctx.graph
                    .get(dep)
                    .map(|d| d.status() != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !blocking.is_empty() {
            return Err(CadreError::tool(
                "delegate_task",
                format!(
                    "task '{}' is blocked by incomplete dependencies: {}",
                    task_name,
                    blocking.join(", ")
                ),
            ));
        }

        propagate_dependency_outputs(&ctx.graph, &task);
        if let Some(instructions) = instructions {
            task.set_input(format!("{}instructions", MANAGER_PREFIX), json!(instructions));
        }

        ctx.bus
            .emit(
                &Event::new(EventType::ManagerDelegated)
                    .with("run_id", ctx.run_id.clone())
                    .with("task", task_name)
                    .with("agent", agent_name),
            )
            .await?;
        ctx.state
            .update_task_state(task_name, TaskStatus::Running, None, None)
            .await?;
        ctx.bus
            .emit(
                &Event::new(EventType::TaskStarted)
                    .with("run_id", ctx.run_id.clone())
                    .with("task", task_name)
                    .with("agent", agent_name),
            )
            .await?;

        match ctx.executor.execute(&ctx.cancel, &task, &runtime).await {
            Ok(()) => {
                ctx.state
                    .update_task_state(
                        task_name,
                        TaskStatus::Completed,
                        Some(task.outputs()),
                        None,
                    )
                    .await?;
                ctx.bus
                    .emit(
                        &Event::new(EventType::TaskCompleted)
                            .with("run_id", ctx.run_id.clone())
                            .with("task", task_name)
                            .with("agent", agent_name),
                    )
                    .await?;
                Ok(json!({
                    "status": "completed",
                    "outputs": task.propagated_outputs(),
                })
                .to_string())
            }
            Err(err) => {
                ctx.state
                    .update_task_state(task_name, TaskStatus::Failed, None, Some(err.to_string()))
                    .await?;
                ctx.bus
                    .emit(
                        &Event::new(EventType::TaskFailed)
                            .with("run_id", ctx.run_id.clone())
                            .with("task", task_name)
                            .with("agent", agent_name)
                            .with("error", err.to_string()),
                    )
                    .await?;
                if err.is_cancellation() {
                    return Err(err);
                }
                Ok(json!({
                    "status": "failed",
                    "error": err.to_string(),
                })
                .to_string())
            }
        }
    }
}

/// `check_status(task_name?)`.
struct CheckStatusTool {
    shared: Arc<RunContext>,
}

#[async_trait]
impl Tool for CheckStatusTool {
    fn name(&self) -> &str {
        "check_status"
    }

    fn description(&self) -> &str {
        "Inspect one task's status (pass task_name) or the whole run (pass nothing)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task_name": {"type": "string", "description": "Optional task to inspect"}
            }
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let ctx = &self.shared;
        if let Some(task_name) = input["task_name"].as_str() {
            let task = ctx.graph.get(task_name).ok_or_else(|| {
                CadreError::tool("check_status", format!("unknown task '{}'", task_name))
            })?;
            let blocking: Vec<String> = task
                .depends_on
                .iter()
                .filter(|dep| {
                    ctx.graph
                        .get(dep)
                        .map(|d| d.status() != TaskStatus::Completed)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            return Ok(json!({
                "name": task.name,
                "status": task.status().as_str(),
                "dependencies": task.depends_on,
                "blocking": blocking,
                "outputs": task.propagated_outputs(),
            })
            .to_string());
        }

        let tasks: Vec<serde_json::Value> = ctx
            .graph
            .tasks()
            .into_iter()
            .map(|task| json!({"name": task.name, "status": task.status().as_str()}))
            .collect();
        let ready: Vec<String> = ctx
            .graph
            .get_ready()
            .into_iter()
            .map(|t| t.name.clone())
            .collect();
        Ok(json!({
            "tasks": tasks,
            "ready": ready,
            "all_complete": ctx.graph.is_complete(),
        })
        .to_string())
    }
}

/// `provide_feedback(task_name, feedback)`.
struct ProvideFeedbackTool {
    shared: Arc<RunContext>,
}

#[async_trait]
impl Tool for ProvideFeedbackTool {
    fn name(&self) -> &str {
        "provide_feedback"
    }

    fn description(&self) -> &str {
        "Record feedback on a task; the feedback is visible to the agent the next time the task runs."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task_name": {"type": "string", "description": "Task the feedback concerns"},
                "feedback": {"type": "string", "description": "The feedback to record"}
            },
            "required": ["task_name", "feedback"]
        })
    }

    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
        let ctx = &self.shared;
        let task_name = input["task_name"]
            .as_str()
            .ok_or_else(|| CadreError::tool("provide_feedback", "missing 'task_name'"))?;
        let feedback = input["feedback"]
            .as_str()
            .ok_or_else(|| CadreError::tool("provide_feedback", "missing 'feedback'"))?;

        let task = ctx.graph.get(task_name).ok_or_else(|| {
            CadreError::tool("provide_feedback", format!("unknown task '{}'", task_name))
        })?;
        task.set_input(format!("{}feedback", MANAGER_PREFIX), json!(feedback));

        ctx.bus
            .emit(
                &Event::new(EventType::ManagerFeedback)
                    .with("run_id", ctx.run_id.clone())
                    .with("task", task_name)
                    .with("feedback", feedback),
            )
            .await?;
        Ok(format!("feedback recorded for task '{}'", task_name))
    }
}
