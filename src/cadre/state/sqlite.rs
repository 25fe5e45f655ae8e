//! Embedded SQLite state store.
//!
//! Single-file store holding three tables: `runs` and `checkpoints` (JSON
//! payloads plus denormalised columns for indexing) and `agent_memory`
//! (per-namespace message rows).  Migrations are idempotent: tables are
//! created with `IF NOT EXISTS`, and the `content_blocks` column is an
//! additive `ALTER TABLE` whose duplicate-column error is swallowed on
//! re-run.
//!
//! Connections are opened per operation inside `spawn_blocking`, so async
//! callers never hold a blocking handle across an await point.  SQLite
//! serialises writers internally; callers treat the store as safe for
//! concurrent use.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::cadre::error::CadreError;
use crate::cadre::memory::MemoryStore;
use crate::cadre::message::{ContentBlock, Message, Role};
use crate::cadre::state::{Checkpoint, RunState, StateStore};

/// File-backed [`StateStore`] + [`MemoryStore`].
pub struct SqliteStateStore {
    path: PathBuf,
}

impl SqliteStateStore {
    /// Open (creating if needed) the store at `path`, running migrations.
    /// The parent directory is created automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CadreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::migrate(&conn)?;
        Ok(Self { path })
    }

    fn migrate(conn: &Connection) -> Result<(), CadreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                crew_name TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at DATETIME NOT NULL,
                completed_at DATETIME,
                error TEXT,
                data JSON NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs (status);
            CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs (started_at);

            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id),
                created_at DATETIME NOT NULL,
                data JSON NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_checkpoints_run_id ON checkpoints (run_id);

            CREATE TABLE IF NOT EXISTS agent_memory (
                id TEXT PRIMARY KEY,
                namespace TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                tool_name TEXT,
                tool_input TEXT,
                tool_call_id TEXT,
                timestamp DATETIME NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_agent_memory_namespace ON agent_memory (namespace);
            CREATE INDEX IF NOT EXISTS idx_agent_memory_namespace_timestamp
                ON agent_memory (namespace, timestamp);
            "#,
        )?;

        // Additive migration; the duplicate-column error means it already ran.
        if let Err(err) = conn.execute(
            "ALTER TABLE agent_memory ADD COLUMN content_blocks JSON",
            [],
        ) {
            let message = err.to_string();
            if !message.contains("duplicate column name") {
                return Err(err.into());
            }
        }
        Ok(())
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, CadreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, CadreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            op(&conn)
        })
        .await
        .map_err(|e| CadreError::state(format!("store task failed: {}", e)))?
    }
}

fn parse_role(role: &str) -> Role {
    match role {
        "assistant" => Role::Assistant,
        "system" => Role::System,
        "tool" => Role::Tool,
        _ => Role::User,
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn save_run(&self, run: &RunState) -> Result<(), CadreError> {
        let run = run.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&run)?;
            conn.execute(
                "INSERT OR REPLACE INTO runs (id, crew_name, status, started_at, completed_at, error, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    run.id,
                    run.crew_name,
                    run.status.as_str(),
                    run.started_at.to_rfc3339(),
                    run.completed_at.map(|t| t.to_rfc3339()),
                    run.error,
                    data,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_run(&self, id: &str) -> Result<Option<RunState>, CadreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT data FROM runs WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => {
                    let data: String = row.get(0)?;
                    Ok(Some(serde_json::from_str(&data)?))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<RunState>, CadreError> {
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT data FROM runs ORDER BY started_at DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
            let mut runs = Vec::new();
            for row in rows {
                let data = row?;
                runs.push(serde_json::from_str(&data)?);
            }
            Ok(runs)
        })
        .await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), CadreError> {
        let checkpoint = checkpoint.clone();
        self.with_conn(move |conn| {
            let data = serde_json::to_string(&checkpoint)?;
            conn.execute(
                "INSERT OR REPLACE INTO checkpoints (id, run_id, created_at, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    checkpoint.id,
                    checkpoint.run.id,
                    checkpoint.created_at.to_rfc3339(),
                    data,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, CadreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT data FROM checkpoints WHERE id = ?1")?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => {
                    let data: String = row.get(0)?;
                    Ok(Some(serde_json::from_str(&data)?))
                }
                None => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
impl MemoryStore for SqliteStateStore {
    async fn append(&self, namespace: &str, message: &Message) -> Result<(), CadreError> {
        let namespace = namespace.to_string();
        let message = message.clone();
        self.with_conn(move |conn| {
            let blocks = message
                .content_blocks
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            let tool_input = message
                .tool_input
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            conn.execute(
                "INSERT INTO agent_memory
                     (id, namespace, role, content, tool_name, tool_input, tool_call_id, timestamp, content_blocks)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    Uuid::new_v4().to_string(),
                    namespace,
                    message.role.as_str(),
                    message.content,
                    message.tool_name,
                    tool_input,
                    message.tool_call_id,
                    message.timestamp.to_rfc3339(),
                    blocks,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn recent(&self, namespace: &str, limit: usize) -> Result<Vec<Message>, CadreError> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT role, content, tool_name, tool_input, tool_call_id, timestamp, content_blocks
                 FROM agent_memory WHERE namespace = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![namespace, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                ))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (role, content, tool_name, tool_input, tool_call_id, timestamp, blocks) = row?;
                let content_blocks: Option<Vec<ContentBlock>> =
                    blocks.as_deref().map(serde_json::from_str).transpose()?;
                let tool_input: Option<serde_json::Value> =
                    tool_input.as_deref().map(serde_json::from_str).transpose()?;
                let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                    .map_err(|e| CadreError::state(format!("bad timestamp in store: {}", e)))?
                    .with_timezone(&Utc);
                messages.push(Message {
                    role: parse_role(&role),
                    content,
                    timestamp,
                    content_blocks,
                    tool_name,
                    tool_call_id,
                    tool_input,
                });
            }
            // rows came back newest first; callers expect chronological order
            messages.reverse();
            Ok(messages)
        })
        .await
    }
}
