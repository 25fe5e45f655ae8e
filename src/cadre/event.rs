//! Lifecycle events and the hook bus.
//!
//! Every transition in a run (crew start/end, task start/end, iteration
//! boundaries, manager delegation) flows through the [`EventBus`] as a
//! typed [`Event`].  Subscribers are [`Hook`]s with a name, an event-type
//! filter (empty filter = match all), and a *blocking* flag:
//!
//! - **Blocking** hooks run synchronously in registration order.  The first
//!   error aborts further processing and is returned to the emitter, which is
//!   how a human-in-the-loop gate (see
//!   [`PauseHook`](crate::cadre::hooks::PauseHook)) can stop a run.
//! - **Non-blocking** hooks run on spawned tasks behind a panic guard;
//!   their errors (and panics) are logged and never affect the run.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};

use crate::cadre::error::CadreError;

/// The lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "crew.started")]
    CrewStarted,
    #[serde(rename = "crew.completed")]
    CrewCompleted,
    #[serde(rename = "crew.failed")]
    CrewFailed,
    #[serde(rename = "task.started")]
    TaskStarted,
    #[serde(rename = "task.completed")]
    TaskCompleted,
    #[serde(rename = "task.failed")]
    TaskFailed,
    #[serde(rename = "crew.iteration.started")]
    IterationStarted,
    #[serde(rename = "crew.iteration.completed")]
    IterationCompleted,
    #[serde(rename = "manager.delegated")]
    ManagerDelegated,
    #[serde(rename = "manager.feedback")]
    ManagerFeedback,
}

impl EventType {
    /// Wire name of the event kind (e.g. `"task.started"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CrewStarted => "crew.started",
            EventType::CrewCompleted => "crew.completed",
            EventType::CrewFailed => "crew.failed",
            EventType::TaskStarted => "task.started",
            EventType::TaskCompleted => "task.completed",
            EventType::TaskFailed => "task.failed",
            EventType::IterationStarted => "crew.iteration.started",
            EventType::IterationCompleted => "crew.iteration.completed",
            EventType::ManagerDelegated => "manager.delegated",
            EventType::ManagerFeedback => "manager.feedback",
        }
    }
}

/// One lifecycle event: a kind, a timestamp, and a data map.
///
/// Well-known data keys: `run_id`, `task`, `agent`, `error`, `iteration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Kind of the event.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
    /// Free-form payload.
    pub data: HashMap<String, serde_json::Value>,
}

impl Event {
    /// Create an event stamped now, with an empty payload.
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data: HashMap::new(),
        }
    }

    /// Attach one payload entry (builder pattern).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// The `run_id` payload entry, when present.
    pub fn run_id(&self) -> Option<&str> {
        self.data.get("run_id").and_then(|v| v.as_str())
    }
}

/// A bus subscriber.
#[async_trait]
pub trait Hook: Send + Sync {
    /// Subscriber name used for registration and unregistration.
    fn name(&self) -> &str;

    /// Event kinds this hook wants.  An empty filter matches every event.
    fn filter(&self) -> Vec<EventType> {
        Vec::new()
    }

    /// Blocking hooks run inline and may abort the emit by erroring.
    fn blocking(&self) -> bool {
        false
    }

    /// Handle one event.
    async fn handle(&self, event: &Event) -> Result<(), CadreError>;
}

struct BusInner {
    hooks: Vec<Arc<dyn Hook>>,
    closed: bool,
}

/// Fans lifecycle events out to registered hooks.
pub struct EventBus {
    inner: RwLock<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(BusInner {
                hooks: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Register a hook.  Registration order is delivery order for blocking
    /// hooks.  Registering on a closed bus is a state error.
    pub fn register(&self, hook: Arc<dyn Hook>) -> Result<(), CadreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.closed {
            return Err(CadreError::state("event bus is closed"));
        }
        inner.hooks.push(hook);
        Ok(())
    }

    /// Remove every hook with the given name.
    pub fn unregister(&self, name: &str) {
        self.inner
            .write()
            .unwrap()
            .hooks
            .retain(|hook| hook.name() != name);
    }

    /// Close the bus: drops all hooks; subsequent emits are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.closed = true;
        inner.hooks.clear();
    }

    /// Number of registered hooks.
    pub fn hook_count(&self) -> usize {
        self.inner.read().unwrap().hooks.len()
    }

    /// Deliver `event` to every hook whose filter matches.
    ///
    /// Blocking hooks run synchronously in registration order; the first
    /// error aborts further processing and is returned.  Non-blocking hooks
    /// run on spawned tasks with a panic guard.
    pub async fn emit(&self, event: &Event) -> Result<(), CadreError> {
        let matching: Vec<Arc<dyn Hook>> = {
            let inner = self.inner.read().unwrap();
            if inner.closed {
                return Ok(());
            }
            inner
                .hooks
                .iter()
                .filter(|hook| {
                    let filter = hook.filter();
                    filter.is_empty() || filter.contains(&event.event_type)
                })
                .cloned()
                .collect()
        };

        for hook in matching {
            if hook.blocking() {
                if let Err(err) = hook.handle(event).await {
                    log::error!(
                        "blocking hook '{}' failed on {}: {}",
                        hook.name(),
                        event.event_type.as_str(),
                        err
                    );
                    return Err(err);
                }
            } else {
                let event = event.clone();
                tokio::spawn(async move {
                    let name = hook.name().to_string();
                    match std::panic::AssertUnwindSafe(hook.handle(&event))
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            log::error!("hook '{}' failed on {}: {}", name, event.event_type.as_str(), err);
                        }
                        Err(_) => {
                            log::error!("hook '{}' panicked on {}", name, event.event_type.as_str());
                        }
                    }
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingHook {
        name: String,
        filter: Vec<EventType>,
        blocking: bool,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &str {
            &self.name
        }
        fn filter(&self) -> Vec<EventType> {
            self.filter.clone()
        }
        fn blocking(&self) -> bool {
            self.blocking
        }
        async fn handle(&self, event: &Event) -> Result<(), CadreError> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.event_type.as_str()));
            if self.fail {
                return Err(CadreError::state("hook refused"));
            }
            Ok(())
        }
    }

    fn hook(
        name: &str,
        filter: Vec<EventType>,
        blocking: bool,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<dyn Hook> {
        Arc::new(RecordingHook {
            name: name.into(),
            filter,
            blocking,
            seen,
            fail,
        })
    }

    #[tokio::test]
    async fn empty_filter_matches_all_and_filters_apply() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(hook("all", vec![], true, seen.clone(), false)).unwrap();
        bus.register(hook(
            "tasks-only",
            vec![EventType::TaskStarted],
            true,
            seen.clone(),
            false,
        ))
        .unwrap();

        bus.emit(&Event::new(EventType::CrewStarted)).await.unwrap();
        bus.emit(&Event::new(EventType::TaskStarted)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                "all:crew.started",
                "all:task.started",
                "tasks-only:task.started"
            ]
        );
    }

    #[tokio::test]
    async fn first_blocking_error_aborts_processing() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(hook("first", vec![], true, seen.clone(), true)).unwrap();
        bus.register(hook("second", vec![], true, seen.clone(), false)).unwrap();

        let err = bus.emit(&Event::new(EventType::TaskStarted)).await.unwrap_err();
        assert_eq!(err.code(), "state");
        // the second hook never ran
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn non_blocking_errors_do_not_abort() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.register(hook("flaky", vec![], false, seen.clone(), true)).unwrap();
        bus.register(hook("steady", vec![], true, seen.clone(), false)).unwrap();

        bus.emit(&Event::new(EventType::TaskCompleted)).await.unwrap();
        // give the spawned hook a moment to run
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn panicking_non_blocking_hook_is_contained() {
        struct PanickingHook;

        #[async_trait]
        impl Hook for PanickingHook {
            fn name(&self) -> &str {
                "panics"
            }
            async fn handle(&self, _event: &Event) -> Result<(), CadreError> {
                panic!("boom");
            }
        }

        let bus = EventBus::new();
        bus.register(Arc::new(PanickingHook)).unwrap();
        // must not propagate the panic
        bus.emit(&Event::new(EventType::CrewFailed)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn unregister_and_close() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        struct CountingHook;

        #[async_trait]
        impl Hook for CountingHook {
            fn name(&self) -> &str {
                "counter"
            }
            fn blocking(&self) -> bool {
                true
            }
            async fn handle(&self, _event: &Event) -> Result<(), CadreError> {
                CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let bus = EventBus::new();
        bus.register(Arc::new(CountingHook)).unwrap();
        bus.emit(&Event::new(EventType::CrewStarted)).await.unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        bus.unregister("counter");
        bus.emit(&Event::new(EventType::CrewStarted)).await.unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        bus.close();
        assert!(bus.register(Arc::new(CountingHook)).is_err());
        bus.emit(&Event::new(EventType::CrewStarted)).await.unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_json_shape() {
        let event = Event::new(EventType::TaskFailed)
            .with("run_id", "r-1")
            .with("task", "impl")
            .with("error", "boom");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "task.failed");
        assert_eq!(value["data"]["run_id"], "r-1");

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back.event_type, EventType::TaskFailed);
        assert_eq!(back.run_id(), Some("r-1"));
    }
}
