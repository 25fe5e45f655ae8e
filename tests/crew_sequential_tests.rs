//! End-to-end tests for the sequential process discipline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cadre::config::CrewConfig;
use cadre::crew::CrewBuilder;
use cadre::error::CadreError;
use cadre::event::{Event, EventBus, Hook};
use cadre::provider::{CompletionRequest, CompletionResponse, ProviderClient, StopReason};
use cadre::sse::SseBroker;
use cadre::state::RunStatus;
use cadre::task::TaskStatus;

/// Provider that answers every prompt with a canned reply, optionally keyed
/// by a marker found in the latest user message.
struct KeyedProvider {
    calls: AtomicUsize,
    replies: Vec<(&'static str, String)>,
    fallback: String,
}

impl KeyedProvider {
    fn new(replies: Vec<(&'static str, String)>, fallback: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            replies,
            fallback: fallback.to_string(),
        }
    }
}

#[async_trait]
impl ProviderClient for KeyedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CadreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| !m.content.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        for (marker, reply) in &self.replies {
            if prompt.contains(marker) {
                return Ok(CompletionResponse::text(reply.clone(), StopReason::EndTurn));
            }
        }
        Ok(CompletionResponse::text(
            self.fallback.clone(),
            StopReason::EndTurn,
        ))
    }

    fn model_name(&self) -> &str {
        "keyed-mock"
    }
}

/// Blocking hook capturing `(type, task)` pairs in delivery order.
struct OrderHook {
    seen: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Hook for OrderHook {
    fn name(&self) -> &str {
        "order-recorder"
    }
    fn blocking(&self) -> bool {
        true
    }
    async fn handle(&self, event: &Event) -> Result<(), CadreError> {
        let task = event
            .data
            .get("task")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        self.seen
            .lock()
            .unwrap()
            .push((event.event_type.as_str().to_string(), task));
        Ok(())
    }
}

fn two_task_config() -> CrewConfig {
    serde_json::from_value(json!({
        "name": "pipeline",
        "agents": [
            {"name": "dev", "role": "Developer", "goal": "implement features"},
            {"name": "rev", "role": "Reviewer", "goal": "review patches"}
        ],
        "tasks": [
            {"name": "impl", "description": "implement the feature", "agent": "dev"},
            {"name": "review", "description": "review the patch", "agent": "rev",
             "depends_on": ["impl"]}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn happy_path_emits_ordered_lifecycle_events() {
    let _ = env_logger::builder().is_test(true).try_init();
    let provider = Arc::new(KeyedProvider::new(vec![], "ok"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(EventBus::new());
    bus.register(Arc::new(OrderHook { seen: seen.clone() })).unwrap();

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(two_task_config())
        .with_provider("default", provider.clone())
        .with_bus(bus)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let outcome = crew
        .run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap();

    let run = crew.state().get_run(&outcome.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);

    let events: Vec<(String, String)> = seen.lock().unwrap().clone();
    let expected = vec![
        ("crew.started", ""),
        ("task.started", "impl"),
        ("task.completed", "impl"),
        ("task.started", "review"),
        ("task.completed", "review"),
        ("crew.completed", ""),
    ];
    let got: Vec<(&str, &str)> = events
        .iter()
        .map(|(t, task)| (t.as_str(), task.as_str()))
        .collect();
    assert_eq!(got, expected);

    // one provider call per task, well inside the call budget
    assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dependency_outputs_propagate_downstream() {
    let provider = Arc::new(KeyedProvider::new(
        vec![(
            "implement the feature",
            "done\n```json\n{\"patch\": \"diff --git a b\", \"_response\": \"hidden\"}\n```".into(),
        )],
        "looks good",
    ));

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(two_task_config())
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    crew.run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap();

    let review = crew.graph().get("review").unwrap();
    assert_eq!(review.get_input("patch").unwrap(), json!("diff --git a b"));
    // the reserved _response key never crosses task boundaries
    assert!(review.get_input("_response").is_none());
}

#[tokio::test]
async fn run_inputs_reach_root_tasks() {
    let provider = Arc::new(KeyedProvider::new(vec![], "ok"));
    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(two_task_config())
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let mut inputs = HashMap::new();
    inputs.insert("ticket".to_string(), json!("CAD-42"));
    crew.run(CancellationToken::new(), inputs).await.unwrap();

    let impl_task = crew.graph().get("impl").unwrap();
    assert_eq!(impl_task.get_input("ticket").unwrap(), json!("CAD-42"));
}

#[tokio::test]
async fn single_failure_fails_the_run_and_checkpoints() {
    struct FailingProvider;

    #[async_trait]
    impl ProviderClient for FailingProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> Result<CompletionResponse, CadreError> {
            let prompt = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            if prompt.contains("review the patch") {
                return Err(CadreError::Api {
                    status: 400,
                    message: "reviewer rejected the request".into(),
                });
            }
            Ok(CompletionResponse::text("ok", StopReason::EndTurn))
        }

        fn model_name(&self) -> &str {
            "failing-mock"
        }
    }

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(two_task_config())
        .with_provider("default", Arc::new(FailingProvider))
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let err = crew
        .run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "api");

    let run = crew.state().get_active_run().await.unwrap();
    // the run is terminal, so there is no active run anymore; scan instead
    assert!(run.is_none() || run.unwrap().status != RunStatus::Running);
    let runs = crew.state().list_runs(1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0].error.as_ref().unwrap().contains("reviewer rejected"));

    assert_eq!(crew.graph().get("impl").unwrap().status(), TaskStatus::Completed);
    assert_eq!(crew.graph().get("review").unwrap().status(), TaskStatus::Failed);

    // a checkpoint was written to the workspace mirror before surfacing
    let mirror = workspace.path().join(".cadre").join("checkpoints");
    let files: Vec<_> = std::fs::read_dir(mirror).unwrap().collect();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn configured_shell_hook_observes_lifecycle_events() {
    let provider = Arc::new(KeyedProvider::new(vec![], "ok"));
    let workspace = tempfile::tempdir().unwrap();
    let log_path = workspace.path().join("events.log");

    let mut config = two_task_config();
    config.hooks = serde_json::from_value(json!([
        {
            "type": "shell",
            "name": "recorder",
            "command": format!("printf '%s\\n' \"$CADRE_EVENT_TYPE\" >> {}", log_path.display()),
            "blocking": true,
            "events": ["task.completed", "crew.completed"]
        }
    ]))
    .unwrap();

    let crew = CrewBuilder::new(config)
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();
    crew.run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap();

    let recorded = std::fs::read_to_string(&log_path).unwrap();
    let lines: Vec<&str> = recorded.lines().collect();
    // the filter kept task.completed (twice) and crew.completed only
    assert_eq!(lines, vec!["task.completed", "task.completed", "crew.completed"]);
}

#[tokio::test]
async fn sse_subscribers_observe_the_run() {
    let provider = Arc::new(KeyedProvider::new(vec![], "ok"));
    let bus = Arc::new(EventBus::new());
    let broker = Arc::new(SseBroker::new());
    bus.register(broker.clone()).unwrap();

    let cancel = CancellationToken::new();
    let mut rx = broker.subscribe(cancel.clone(), "observer", None);

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(two_task_config())
        .with_provider("default", provider)
        .with_bus(bus)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();
    crew.run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap();

    // drain what arrived; the broker hook is non-blocking, give it a beat
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame.frame_type);
    }
    assert_eq!(frames.first().map(String::as_str), Some("connected"));
    assert!(frames.iter().any(|f| f == "crew.started"));
    assert!(frames.iter().any(|f| f == "task.completed"));
    assert!(frames.iter().any(|f| f == "crew.completed"));
}
