//! Agent memory.
//!
//! A [`Memory`] owns the ordered message log for one agent (or for a whole
//! crew, when shared).  It keeps the log within a token budget by dropping
//! from the oldest end, and can be backed by a durable [`MemoryStore`] so
//! conversations survive process restarts.
//!
//! Persistence is write-through and best-effort: a failing store write is
//! logged and the in-memory append still succeeds, so an unhealthy disk never
//! fails an agent turn.
//!
//! Shared memory is a namespace discipline over a single physical store:
//! every participating agent reads and writes the namespace
//! `shared:<crew-name>`.  Concurrent writes interleave at message
//! granularity.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cadre::error::CadreError;
use crate::cadre::message::{Message, Role};

/// How many persisted messages are loaded when a store is attached.
const BOOTSTRAP_LIMIT: usize = 200;

/// Truncation never drops below this many messages.
const MIN_RETAINED: usize = 2;

/// Kind of memory an agent declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Per-agent rolling conversation (the default).
    Conversation,
    /// Per-agent durable memory intended to span runs.
    LongTerm,
    /// One namespace shared by every agent in the crew that declares it.
    Shared,
}

impl Default for MemoryType {
    fn default() -> Self {
        MemoryType::Conversation
    }
}

/// Durable backing for one or more memory namespaces.
///
/// The same store may host many namespaces; the embedded SQL store keeps them
/// all in one `agent_memory` table.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Persist one message under `namespace`.
    async fn append(&self, namespace: &str, message: &Message) -> Result<(), CadreError>;

    /// Load up to `limit` most-recent messages for `namespace`, oldest first.
    async fn recent(&self, namespace: &str, limit: usize) -> Result<Vec<Message>, CadreError>;
}

struct MemoryInner {
    messages: Vec<Message>,
    store: Option<Arc<dyn MemoryStore>>,
    namespace: String,
}

/// Ordered, token-budgeted message log with optional durable backing.
pub struct Memory {
    memory_type: MemoryType,
    max_tokens: usize,
    inner: RwLock<MemoryInner>,
}

impl Memory {
    /// Create an empty memory with the given type tag and token budget.
    pub fn new(memory_type: MemoryType, max_tokens: usize) -> Self {
        Self {
            memory_type,
            max_tokens,
            inner: RwLock::new(MemoryInner {
                messages: Vec::new(),
                store: None,
                namespace: String::new(),
            }),
        }
    }

    /// The declared memory type.
    pub fn memory_type(&self) -> MemoryType {
        self.memory_type
    }

    /// The token budget truncation enforces.
    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    /// Attach a durable store under `namespace`.
    ///
    /// Bootstraps the log with up to 200 most-recent persisted messages for
    /// the namespace, then truncates to budget.  Subsequent appends are
    /// written through.
    pub async fn attach_store(
        &self,
        store: Arc<dyn MemoryStore>,
        namespace: impl Into<String>,
    ) -> Result<(), CadreError> {
        let namespace = namespace.into();
        let persisted = store.recent(&namespace, BOOTSTRAP_LIMIT).await?;
        let mut inner = self.inner.write().await;
        inner.messages = persisted;
        inner.store = Some(store);
        inner.namespace = namespace;
        self.truncate_locked(&mut inner);
        Ok(())
    }

    /// Namespace the attached store uses, empty when no store is attached.
    pub async fn namespace(&self) -> String {
        self.inner.read().await.namespace.clone()
    }

    /// Append a message, write it through to the store (best-effort), and
    /// truncate back to budget.
    pub async fn append(&self, message: Message) {
        let mut inner = self.inner.write().await;
        if let Some(store) = inner.store.clone() {
            if let Err(err) = store.append(&inner.namespace, &message).await {
                log::warn!(
                    "memory write-through failed for namespace '{}': {}",
                    inner.namespace,
                    err
                );
            }
        }
        inner.messages.push(message);
        self.truncate_locked(&mut inner);
    }

    /// Snapshot of every message, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        self.inner.read().await.messages.clone()
    }

    /// The `n` most recent messages, oldest first.
    pub async fn last(&self, n: usize) -> Vec<Message> {
        let inner = self.inner.read().await;
        let start = inner.messages.len().saturating_sub(n);
        inner.messages[start..].to_vec()
    }

    /// Messages authored with `role`.
    pub async fn by_role(&self, role: Role) -> Vec<Message> {
        self.inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.role == role)
            .cloned()
            .collect()
    }

    /// Case-insensitive substring search over message content.
    pub async fn search(&self, query: &str) -> Vec<Message> {
        let needle = query.to_lowercase();
        self.inner
            .read()
            .await
            .messages
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Number of messages currently held.
    pub async fn len(&self) -> usize {
        self.inner.read().await.messages.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.messages.is_empty()
    }

    /// Current approximate token cost of the log.
    pub async fn estimated_tokens(&self) -> usize {
        let inner = self.inner.read().await;
        inner.messages.iter().map(Message::estimated_tokens).sum()
    }

    /// Drop every in-memory message.  The backing store is left untouched.
    pub async fn clear(&self) {
        self.inner.write().await.messages.clear();
    }

    /// Replace the in-memory log wholesale, without store writes.  Used when
    /// a checkpoint's memory snapshot is restored.
    pub async fn restore(&self, messages: Vec<Message>) {
        let mut inner = self.inner.write().await;
        inner.messages = messages;
        self.truncate_locked(&mut inner);
    }

    /// Drop from the oldest end while over budget, always retaining the two
    /// most recent messages.
    fn truncate_locked(&self, inner: &mut MemoryInner) {
        let mut total: usize = inner.messages.iter().map(Message::estimated_tokens).sum();
        while total > self.max_tokens && inner.messages.len() > MIN_RETAINED {
            let removed = inner.messages.remove(0);
            total -= removed.estimated_tokens();
        }
    }
}
