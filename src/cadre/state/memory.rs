//! In-memory state store.
//!
//! Non-durable backing used by tests and by crews that opt out of
//! persistence.  Runs and checkpoints live in maps behind a read-write lock.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::cadre::error::CadreError;
use crate::cadre::state::{Checkpoint, RunState, StateStore};

/// Map-backed [`StateStore`].
#[derive(Default)]
pub struct MemoryStateStore {
    runs: RwLock<HashMap<String, RunState>>,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_run(&self, run: &RunState) -> Result<(), CadreError> {
        self.runs.write().await.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, id: &str) -> Result<Option<RunState>, CadreError> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunState>, CadreError> {
        let mut runs: Vec<RunState> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CadreError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, CadreError> {
        Ok(self.checkpoints.read().await.get(id).cloned())
    }
}
