//! Task value object.
//!
//! A [`Task`] is created from configuration when its containing graph is
//! built and mutated only by the coordinator driving that graph.  Inputs and
//! outputs live behind a mutex so dependents on other worker threads can read
//! them safely, but only after the owning coordinator has transitioned the
//! task to `completed`.
//!
//! Two key namespaces are reserved: the `_response` output (the raw model
//! reply) is never propagated to downstream tasks, and `_manager_*` inputs
//! are a coordinator-only channel used by the hierarchical manager.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cadre::error::CadreError;

/// Reserved output key holding the raw model reply.
pub const RESPONSE_KEY: &str = "_response";

/// Prefix of coordinator-only input channels.
pub const MANAGER_PREFIX: &str = "_manager_";

/// Whether an output key may propagate to downstream task inputs.
pub fn propagates(key: &str) -> bool {
    !key.starts_with('_')
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Completed, failed, and skipped are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }
}

/// How executor retry waits grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base × 2^(attempt-1)`
    Exponential,
    /// `base × attempt`
    Linear,
    /// `base`
    Constant,
}

impl Default for BackoffKind {
    fn default() -> Self {
        BackoffKind::Exponential
    }
}

/// Per-task retry policy applied by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaskRetry {
    /// Total executions allowed (1 = no retry).
    pub max_attempts: u32,
    /// Wait growth between attempts.
    #[serde(default)]
    pub backoff: BackoffKind,
}

impl Default for TaskRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffKind::Exponential,
        }
    }
}

impl TaskRetry {
    /// Backoff wait before retry number `attempt` (1-based), over `base`.
    pub fn delay(&self, base: Duration, attempt: u32) -> Duration {
        match self.backoff {
            BackoffKind::Exponential => {
                base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
            BackoffKind::Linear => base.saturating_mul(attempt.max(1)),
            BackoffKind::Constant => base,
        }
    }
}

/// Serializable view of a task's mutable state, persisted in run records and
/// checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub status: TaskStatus,
    pub inputs: HashMap<String, serde_json::Value>,
    pub outputs: HashMap<String, serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TaskState {
    status: Option<TaskStatus>,
    inputs: HashMap<String, serde_json::Value>,
    outputs: HashMap<String, serde_json::Value>,
    error: Option<String>,
    attempts: u32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskState {
    fn status(&self) -> TaskStatus {
        self.status.unwrap_or(TaskStatus::Pending)
    }
}

/// One unit of work assigned to an agent.
#[derive(Debug)]
pub struct Task {
    /// Unique name within the crew.
    pub name: String,
    /// What the agent is asked to do.
    pub description: String,
    /// Name of the agent configured to run this task.  The hierarchical
    /// manager may reassign at delegation time.
    pub agent: String,
    /// Names of tasks that must complete before this one starts.
    pub depends_on: Vec<String>,
    /// Optional per-task deadline applied by the executor.
    pub timeout: Option<Duration>,
    /// Retry policy applied by the executor.
    pub retry: TaskRetry,
    state: Mutex<TaskState>,
}

impl Task {
    /// Create a pending task.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        agent: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            agent: agent.into(),
            depends_on: Vec::new(),
            timeout: None,
            retry: TaskRetry::default(),
            state: Mutex::new(TaskState::default()),
        }
    }

    /// Declare dependencies (builder pattern).
    pub fn with_dependencies(mut self, depends_on: Vec<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Set a per-task timeout (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy (builder pattern).
    pub fn with_retry(mut self, retry: TaskRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Seed declared inputs (builder pattern).
    pub fn with_inputs(self, inputs: HashMap<String, serde_json::Value>) -> Self {
        self.state.lock().unwrap().inputs = inputs;
        self
    }

    /// Current status.
    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status()
    }

    /// Recorded error text, if the task failed.
    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    /// Executions performed so far.
    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    /// Increment and return the attempt counter.
    pub fn record_attempt(&self) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        state.attempts
    }

    /// Set one input value.
    pub fn set_input(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state.lock().unwrap().inputs.insert(key.into(), value);
    }

    /// Read one input value.
    pub fn get_input(&self, key: &str) -> Option<serde_json::Value> {
        self.state.lock().unwrap().inputs.get(key).cloned()
    }

    /// Merge a map into the inputs (existing keys are overwritten).
    pub fn merge_inputs(&self, inputs: &HashMap<String, serde_json::Value>) {
        let mut state = self.state.lock().unwrap();
        for (k, v) in inputs {
            state.inputs.insert(k.clone(), v.clone());
        }
    }

    /// Snapshot of all inputs.
    pub fn inputs(&self) -> HashMap<String, serde_json::Value> {
        self.state.lock().unwrap().inputs.clone()
    }

    /// Snapshot of all outputs.
    pub fn outputs(&self) -> HashMap<String, serde_json::Value> {
        self.state.lock().unwrap().outputs.clone()
    }

    /// Outputs that may propagate downstream (non-underscore keys).
    pub fn propagated_outputs(&self) -> HashMap<String, serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .outputs
            .iter()
            .filter(|(k, _)| propagates(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Transition `pending → running`, stamping `started_at`.
    pub fn start(&self) -> Result<(), CadreError> {
        let mut state = self.state.lock().unwrap();
        if state.status() != TaskStatus::Pending {
            return Err(CadreError::state(format!(
                "task '{}' cannot start from status {}",
                self.name,
                state.status().as_str()
            )));
        }
        state.status = Some(TaskStatus::Running);
        state.started_at = Some(Utc::now());
        Ok(())
    }

    /// Transition `running → completed`, recording outputs.
    pub fn complete(&self, outputs: HashMap<String, serde_json::Value>) -> Result<(), CadreError> {
        let mut state = self.state.lock().unwrap();
        if state.status() != TaskStatus::Running {
            return Err(CadreError::state(format!(
                "task '{}' cannot complete from status {}",
                self.name,
                state.status().as_str()
            )));
        }
        state.status = Some(TaskStatus::Completed);
        state.outputs = outputs;
        state.error = None;
        state.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Transition `running → failed`, recording the error string.
    pub fn fail(&self, error: impl Into<String>) -> Result<(), CadreError> {
        let mut state = self.state.lock().unwrap();
        if state.status() != TaskStatus::Running {
            return Err(CadreError::state(format!(
                "task '{}' cannot fail from status {}",
                self.name,
                state.status().as_str()
            )));
        }
        state.status = Some(TaskStatus::Failed);
        state.error = Some(error.into());
        state.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark the task skipped (terminal without execution).
    pub fn skip(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = Some(TaskStatus::Skipped);
        state.completed_at = Some(Utc::now());
    }

    /// Back to `pending`: clears outputs, error, attempts, and timestamps.
    /// The iterative coordinator calls this between iterations.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = Some(TaskStatus::Pending);
        state.outputs.clear();
        state.error = None;
        state.attempts = 0;
        state.started_at = None;
        state.completed_at = None;
    }

    /// Back to `pending` while keeping the attempt counter.  Used when the
    /// manager re-delegates a failed task that still has retries remaining.
    pub fn rearm(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = Some(TaskStatus::Pending);
        state.error = None;
        state.completed_at = None;
    }

    /// Serializable view of the mutable state.
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock().unwrap();
        TaskSnapshot {
            status: state.status(),
            inputs: state.inputs.clone(),
            outputs: state.outputs.clone(),
            error: state.error.clone(),
            attempts: state.attempts,
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }

    /// Restore mutable state from a snapshot (used by resume).  A snapshot
    /// caught mid-flight (`running`) is rolled back to `pending` so the task
    /// re-executes.
    pub fn restore(&self, snapshot: &TaskSnapshot) {
        let mut state = self.state.lock().unwrap();
        state.status = Some(match snapshot.status {
            TaskStatus::Running => TaskStatus::Pending,
            other => other,
        });
        state.inputs = snapshot.inputs.clone();
        state.outputs = snapshot.outputs.clone();
        state.error = snapshot.error.clone();
        state.attempts = snapshot.attempts;
        state.started_at = snapshot.started_at;
        state.completed_at = snapshot.completed_at;
    }
}
