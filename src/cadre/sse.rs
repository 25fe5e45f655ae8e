//! SSE broker.
//!
//! Fans lifecycle events out to subscribed stream clients.  Each client gets
//! a bounded channel (default capacity 64) of [`SseFrame`]s, the JSON
//! payloads a route handler writes as `data:` lines.  The broker is
//! transport-free: HTTP route handling is an external collaborator that
//! simply drains the receiver.
//!
//! Slow consumers never stall a run: when a client's channel is full the
//! event is dropped for that client and a warning is logged.
//!
//! The broker also implements [`Hook`], so registering it on the
//! [`EventBus`](crate::cadre::event::EventBus) wires the whole lifecycle
//! stream to subscribers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cadre::error::CadreError;
use crate::cadre::event::{Event, Hook};

/// Default bound on a client's event channel.
pub const DEFAULT_CLIENT_BUFFER: usize = 64;

/// One frame of the event stream: `{type, timestamp, run_id?, data}`.
#[derive(Debug, Clone, Serialize)]
pub struct SseFrame {
    /// Event kind wire name, or `"connected"` for the subscription greeting.
    #[serde(rename = "type")]
    pub frame_type: String,
    /// When the frame was created.
    pub timestamp: DateTime<Utc>,
    /// Run the frame belongs to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Event payload.
    pub data: serde_json::Value,
}

impl SseFrame {
    /// The greeting frame every new subscription receives first.
    fn connected(client_id: &str) -> Self {
        Self {
            frame_type: "connected".into(),
            timestamp: Utc::now(),
            run_id: None,
            data: serde_json::json!({ "client_id": client_id }),
        }
    }

    /// Convert a bus event into a stream frame.
    fn from_event(event: &Event) -> Self {
        Self {
            frame_type: event.event_type.as_str().to_string(),
            timestamp: event.timestamp,
            run_id: event.run_id().map(str::to_string),
            data: serde_json::to_value(&event.data).unwrap_or(serde_json::Value::Null),
        }
    }
}

struct SseClient {
    run_filter: Option<String>,
    tx: mpsc::Sender<SseFrame>,
}

/// Name → client map with bounded per-client buffers.
pub struct SseBroker {
    clients: Arc<RwLock<HashMap<String, SseClient>>>,
    capacity: usize,
}

impl Default for SseBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SseBroker {
    /// Create a broker with the default per-client buffer.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CLIENT_BUFFER)
    }

    /// Create a broker with an explicit per-client buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Register a client and return its frame receiver.
    ///
    /// The first frame delivered is the `connected` greeting.  When `cancel`
    /// fires (the subscriber's connection ended) the client is removed and
    /// its channel closed.  An optional `run_filter` restricts delivery to
    /// frames of one run.
    pub fn subscribe(
        &self,
        cancel: CancellationToken,
        client_id: impl Into<String>,
        run_filter: Option<String>,
    ) -> mpsc::Receiver<SseFrame> {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::channel(self.capacity);

        // capacity is at least 1, so the greeting always fits
        let _ = tx.try_send(SseFrame::connected(&client_id));

        self.clients.write().unwrap().insert(
            client_id.clone(),
            SseClient {
                run_filter,
                tx,
            },
        );

        let clients = Arc::clone(&self.clients);
        tokio::spawn(async move {
            cancel.cancelled().await;
            clients.write().unwrap().remove(&client_id);
        });

        rx
    }

    /// Number of live subscriptions.
    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Deliver an event to every matching client.
    pub fn broadcast(&self, event: &Event) {
        let frame = SseFrame::from_event(event);
        let mut disconnected = Vec::new();
        {
            let clients = self.clients.read().unwrap();
            for (id, client) in clients.iter() {
                if let Some(filter) = &client.run_filter {
                    if frame.run_id.as_deref() != Some(filter.as_str()) {
                        continue;
                    }
                }
                match client.tx.try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::warn!(
                            "sse client '{}' is a slow consumer; dropping {}",
                            id,
                            frame.frame_type
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        disconnected.push(id.clone());
                    }
                }
            }
        }
        if !disconnected.is_empty() {
            let mut clients = self.clients.write().unwrap();
            for id in disconnected {
                clients.remove(&id);
            }
        }
    }
}

#[async_trait]
impl Hook for SseBroker {
    fn name(&self) -> &str {
        "sse-broadcaster"
    }

    async fn handle(&self, event: &Event) -> Result<(), CadreError> {
        self.broadcast(event);
        Ok(())
    }
}
