//! Durable run state.
//!
//! A [`RunState`] is the record of one crew execution: status, timestamps,
//! inputs/outputs, per-task states, and a free-form metadata bag.  The
//! [`StateManager`] owns the active run, guards every mutation behind a
//! single writer lock, and re-persists through a pluggable [`StateStore`]
//! after each change.
//!
//! Two store backings share the interface: an in-memory map
//! ([`MemoryStateStore`](crate::cadre::state::memory::MemoryStateStore),
//! non-durable) and the embedded SQLite store
//! ([`SqliteStateStore`](crate::cadre::state::sqlite::SqliteStateStore)).
//!
//! Checkpoints snapshot the run plus the currently running task and any
//! per-agent memories.  Every successful checkpoint save is mirrored to
//! `<workspace>/.cadre/checkpoints/<id>.json` as pretty-printed JSON.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cadre::error::CadreError;
use crate::cadre::message::Message;
use crate::cadre::task::{TaskSnapshot, TaskStatus};

pub use memory::MemoryStateStore;
pub use sqlite::SqliteStateStore;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Completed, failed, and cancelled are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Durable record of one crew execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// UUID of the run.
    pub id: String,
    /// Name of the crew that produced it.
    pub crew_name: String,
    /// Current status; terminal on the first completed/failed/cancelled.
    pub status: RunStatus,
    /// Stamped at construction.
    pub started_at: DateTime<Utc>,
    /// Stamped on the terminal transition.
    pub completed_at: Option<DateTime<Utc>>,
    /// Run inputs as provided by the caller.
    pub inputs: HashMap<String, serde_json::Value>,
    /// Final outputs (union of leaf-task outputs).
    pub outputs: HashMap<String, serde_json::Value>,
    /// Error string when the run failed.
    pub error: Option<String>,
    /// Per-task states keyed by task name.
    pub task_states: HashMap<String, TaskSnapshot>,
    /// Free-form metadata (current/max iteration, correlation ids, ...).
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RunState {
    /// Create a running record with a fresh UUID and `started_at` stamped.
    pub fn new(crew_name: impl Into<String>, inputs: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            crew_name: crew_name.into(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            inputs,
            outputs: HashMap::new(),
            error: None,
            task_states: HashMap::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A run snapshot taken mid-flight: the run state, the task that was running,
/// and any per-agent memory logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUID of the checkpoint itself.
    pub id: String,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// The run as of the snapshot.
    pub run: RunState,
    /// Name of the task that was running, if any.
    pub current_task: Option<String>,
    /// Per-agent memory snapshots keyed by agent name.
    pub memories: HashMap<String, Vec<Message>>,
}

impl Checkpoint {
    /// Snapshot `run` with a fresh checkpoint id.
    pub fn new(
        run: RunState,
        current_task: Option<String>,
        memories: HashMap<String, Vec<Message>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            run,
            current_task,
            memories,
        }
    }
}

/// Pluggable persistence for runs and checkpoints.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Insert or replace a run record.
    async fn save_run(&self, run: &RunState) -> Result<(), CadreError>;

    /// Load a run by id.
    async fn load_run(&self, id: &str) -> Result<Option<RunState>, CadreError>;

    /// Most recent runs first, up to `limit`.
    async fn list_runs(&self, limit: usize) -> Result<Vec<RunState>, CadreError>;

    /// Insert a checkpoint record.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CadreError>;

    /// Load a checkpoint by id.
    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, CadreError>;
}

/// Guards the active run and re-persists after every mutation.
///
/// A single writer lock serialises all state mutations; readers take the
/// shared side.  Active-run resolution prefers the in-memory pointer and
/// falls back to the most recently started `running` record in the store.
pub struct StateManager {
    store: Arc<dyn StateStore>,
    active: RwLock<Option<RunState>>,
    workspace: PathBuf,
}

impl StateManager {
    /// Create a manager over `store`, mirroring checkpoints under
    /// `<workspace>/.cadre/checkpoints/`.
    pub fn new(store: Arc<dyn StateStore>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            store,
            active: RwLock::new(None),
            workspace: workspace.into(),
        }
    }

    /// Begin a run: status `running`, UUID assigned, persisted.
    pub async fn start_run(
        &self,
        crew_name: &str,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<RunState, CadreError> {
        let run = RunState::new(crew_name, inputs);
        self.store.save_run(&run).await?;
        *self.active.write().await = Some(run.clone());
        Ok(run)
    }

    /// Adopt an existing run as active (used by resume) and re-persist it.
    pub async fn adopt_run(&self, mut run: RunState) -> Result<RunState, CadreError> {
        run.status = RunStatus::Running;
        run.completed_at = None;
        run.error = None;
        self.store.save_run(&run).await?;
        *self.active.write().await = Some(run.clone());
        Ok(run)
    }

    /// Replace the active run record wholesale and persist.
    pub async fn update_run(&self, run: RunState) -> Result<(), CadreError> {
        self.store.save_run(&run).await?;
        *self.active.write().await = Some(run);
        Ok(())
    }

    /// Terminal transition to `completed` with final outputs.
    pub async fn complete_run(
        &self,
        outputs: HashMap<String, serde_json::Value>,
    ) -> Result<(), CadreError> {
        self.finish(RunStatus::Completed, Some(outputs), None).await
    }

    /// Terminal transition to `failed` with an error string.
    pub async fn fail_run(&self, error: &str) -> Result<(), CadreError> {
        self.finish(RunStatus::Failed, None, Some(error.to_string())).await
    }

    /// Terminal transition to `cancelled`.
    pub async fn cancel_run(&self, error: &str) -> Result<(), CadreError> {
        self.finish(RunStatus::Cancelled, None, Some(error.to_string())).await
    }

    async fn finish(
        &self,
        status: RunStatus,
        outputs: Option<HashMap<String, serde_json::Value>>,
        error: Option<String>,
    ) -> Result<(), CadreError> {
        let mut guard = self.active.write().await;
        let run = guard
            .as_mut()
            .ok_or_else(|| CadreError::state("no active run"))?;
        if run.status.is_terminal() {
            return Err(CadreError::state(format!(
                "run {} is already {}",
                run.id,
                run.status.as_str()
            )));
        }
        run.status = status;
        run.completed_at = Some(Utc::now());
        if let Some(outputs) = outputs {
            run.outputs = outputs;
        }
        run.error = error;
        self.store.save_run(run).await
    }

    /// Record a task transition on the active run.  Stamps `started_at` when
    /// the status is `running` and `completed_at` on `completed`/`failed`.
    pub async fn update_task_state(
        &self,
        task_name: &str,
        status: TaskStatus,
        outputs: Option<HashMap<String, serde_json::Value>>,
        error: Option<String>,
    ) -> Result<(), CadreError> {
        let mut guard = self.active.write().await;
        let run = guard
            .as_mut()
            .ok_or_else(|| CadreError::state("no active run"))?;
        let entry = run
            .task_states
            .entry(task_name.to_string())
            .or_insert_with(|| TaskSnapshot {
                status,
                inputs: HashMap::new(),
                outputs: HashMap::new(),
                error: None,
                attempts: 0,
                started_at: None,
                completed_at: None,
            });
        entry.status = status;
        match status {
            TaskStatus::Running => entry.started_at = Some(Utc::now()),
            TaskStatus::Completed | TaskStatus::Failed => {
                entry.completed_at = Some(Utc::now());
            }
            _ => {}
        }
        if let Some(outputs) = outputs {
            entry.outputs = outputs;
        }
        if let Some(error) = error {
            entry.error = Some(error);
        }
        self.store.save_run(run).await
    }

    /// Set one metadata key on the active run and persist.
    pub async fn set_metadata(
        &self,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), CadreError> {
        let mut guard = self.active.write().await;
        let run = guard
            .as_mut()
            .ok_or_else(|| CadreError::state("no active run"))?;
        run.metadata.insert(key.to_string(), value);
        self.store.save_run(run).await
    }

    /// Snapshot of the active run, if any.
    pub async fn active_run(&self) -> Option<RunState> {
        self.active.read().await.clone()
    }

    /// The active run: the in-memory pointer when set and still running, else
    /// the most recently started `running` record in the store.
    pub async fn get_active_run(&self) -> Result<Option<RunState>, CadreError> {
        if let Some(run) = self.active.read().await.clone() {
            if !run.status.is_terminal() {
                return Ok(Some(run));
            }
            return Ok(None);
        }
        let runs = self.store.list_runs(64).await?;
        Ok(runs
            .into_iter()
            .filter(|run| run.status == RunStatus::Running)
            .max_by_key(|run| run.started_at))
    }

    /// Load a run by id: the active pointer when it matches, else the store.
    pub async fn get_run(&self, id: &str) -> Result<Option<RunState>, CadreError> {
        if let Some(run) = self.active.read().await.as_ref() {
            if run.id == id {
                return Ok(Some(run.clone()));
            }
        }
        self.store.load_run(id).await
    }

    /// Most recent runs first, up to `limit`.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunState>, CadreError> {
        self.store.list_runs(limit).await
    }

    /// Snapshot the active run into a checkpoint, persist it, and mirror it
    /// to `<workspace>/.cadre/checkpoints/<id>.json`.
    pub async fn save_checkpoint(
        &self,
        current_task: Option<String>,
        memories: HashMap<String, Vec<Message>>,
    ) -> Result<Checkpoint, CadreError> {
        let run = self
            .active
            .read()
            .await
            .clone()
            .ok_or_else(|| CadreError::state("no active run to checkpoint"))?;
        let checkpoint = Checkpoint::new(run, current_task, memories);
        self.store.save_checkpoint(&checkpoint).await?;
        self.mirror_checkpoint(&checkpoint).await?;
        Ok(checkpoint)
    }

    /// Load a checkpoint by id.
    pub async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, CadreError> {
        self.store.load_checkpoint(id).await
    }

    async fn mirror_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CadreError> {
        let dir = self.workspace.join(".cadre").join("checkpoints");
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", checkpoint.id));
        let payload = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager() -> (StateManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = StateManager::new(Arc::new(MemoryStateStore::new()), dir.path());
        (manager, dir)
    }

    #[tokio::test]
    async fn start_complete_cycle_persists() {
        let (manager, _dir) = manager();
        let mut inputs = HashMap::new();
        inputs.insert("topic".to_string(), json!("rust"));
        let run = manager.start_run("demo", inputs).await.unwrap();
        assert_eq!(run.status, RunStatus::Running);

        let mut outputs = HashMap::new();
        outputs.insert("summary".to_string(), json!("done"));
        manager.complete_run(outputs).await.unwrap();

        let loaded = manager.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.outputs["summary"], json!("done"));
    }

    #[tokio::test]
    async fn terminal_runs_refuse_further_transitions() {
        let (manager, _dir) = manager();
        manager.start_run("demo", HashMap::new()).await.unwrap();
        manager.fail_run("boom").await.unwrap();
        assert!(manager.complete_run(HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn task_state_stamps_timestamps() {
        let (manager, _dir) = manager();
        manager.start_run("demo", HashMap::new()).await.unwrap();

        manager
            .update_task_state("impl", TaskStatus::Running, None, None)
            .await
            .unwrap();
        let run = manager.active_run().await.unwrap();
        assert!(run.task_states["impl"].started_at.is_some());
        assert!(run.task_states["impl"].completed_at.is_none());

        manager
            .update_task_state("impl", TaskStatus::Completed, None, None)
            .await
            .unwrap();
        let run = manager.active_run().await.unwrap();
        assert!(run.task_states["impl"].completed_at.is_some());
    }

    #[tokio::test]
    async fn checkpoint_mirrors_to_workspace_file() {
        let (manager, dir) = manager();
        manager.start_run("demo", HashMap::new()).await.unwrap();
        let checkpoint = manager
            .save_checkpoint(Some("impl".to_string()), HashMap::new())
            .await
            .unwrap();

        let mirror = dir
            .path()
            .join(".cadre")
            .join("checkpoints")
            .join(format!("{}.json", checkpoint.id));
        let content = std::fs::read_to_string(mirror).unwrap();
        assert!(content.contains(&checkpoint.id));
        assert!(content.contains("\"current_task\": \"impl\""));

        let loaded = manager.load_checkpoint(&checkpoint.id).await.unwrap().unwrap();
        assert_eq!(loaded.current_task.as_deref(), Some("impl"));
    }

    #[tokio::test]
    async fn active_run_falls_back_to_store_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateStore::new());

        // a run recorded by some earlier manager instance
        let run = RunState::new("demo", HashMap::new());
        store.save_run(&run).await.unwrap();

        let manager = StateManager::new(store, dir.path());
        let active = manager.get_active_run().await.unwrap().unwrap();
        assert_eq!(active.id, run.id);
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let (manager, _dir) = manager();
        let run = manager.start_run("demo", HashMap::new()).await.unwrap();
        manager.set_metadata("current_iteration", json!(2)).await.unwrap();

        let loaded = manager.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.metadata["current_iteration"], json!(2));
    }
}
