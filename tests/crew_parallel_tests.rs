//! End-to-end tests for the parallel process discipline and its error
//! strategies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cadre::config::CrewConfig;
use cadre::crew::CrewBuilder;
use cadre::error::CadreError;
use cadre::provider::{CompletionRequest, CompletionResponse, ProviderClient, StopReason};
use cadre::state::RunStatus;
use cadre::task::TaskStatus;

/// Provider driven by markers in the latest user prompt: a marker can fail,
/// delay, or answer with a fixed reply.
struct MarkedProvider {
    /// (marker, delay, outcome); first match wins.
    script: Vec<(&'static str, Duration, Result<String, CadreError>)>,
    prompts: Mutex<Vec<String>>,
}

impl MarkedProvider {
    fn new(script: Vec<(&'static str, Duration, Result<String, CadreError>)>) -> Self {
        Self {
            script,
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProviderClient for MarkedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, CadreError> {
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| !m.content.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt.clone());

        for (marker, delay, outcome) in &self.script {
            if prompt.contains(marker) {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                return outcome
                    .clone()
                    .map(|reply| CompletionResponse::text(reply, StopReason::EndTurn));
            }
        }
        Ok(CompletionResponse::text("ok", StopReason::EndTurn))
    }

    fn model_name(&self) -> &str {
        "marked-mock"
    }
}

fn failure(message: &str) -> Result<String, CadreError> {
    Err(CadreError::Api {
        status: 400,
        message: message.into(),
    })
}

fn parallel_config(tasks: serde_json::Value, strategy: &str, concurrency: usize) -> CrewConfig {
    serde_json::from_value(json!({
        "name": "fanout",
        "process": "parallel",
        "concurrency": concurrency,
        "error_strategy": strategy,
        "agents": [{"name": "worker", "role": "Worker"}],
        "tasks": tasks
    }))
    .unwrap()
}

#[tokio::test]
async fn fail_fast_cancels_in_flight_work() {
    let _ = env_logger::builder().is_test(true).try_init();
    // a fails immediately; b, c, d are slow enough to still be in flight
    let provider = Arc::new(MarkedProvider::new(vec![
        ("job alpha", Duration::ZERO, failure("alpha exploded")),
        ("job beta", Duration::from_millis(500), Ok("ok".into())),
        ("job gamma", Duration::from_millis(500), Ok("ok".into())),
        ("job delta", Duration::from_millis(500), Ok("ok".into())),
    ]));
    let config = parallel_config(
        json!([
            {"name": "a", "description": "job alpha", "agent": "worker"},
            {"name": "b", "description": "job beta", "agent": "worker"},
            {"name": "c", "description": "job gamma", "agent": "worker"},
            {"name": "d", "description": "job delta", "agent": "worker"}
        ]),
        "fail-fast",
        4,
    );

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(config)
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let err = crew
        .run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap_err();
    // the surfaced error is the first task failure, not a cancellation
    assert!(err.to_string().contains("alpha exploded"));

    let runs = crew.state().list_runs(1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);

    assert_eq!(crew.graph().get("a").unwrap().status(), TaskStatus::Failed);
    // the in-flight tasks were cancelled, not completed
    for name in ["b", "c", "d"] {
        let task = crew.graph().get(name).unwrap();
        assert_ne!(task.status(), TaskStatus::Completed, "task {} completed", name);
    }
}

#[tokio::test]
async fn continue_all_finishes_independent_work() {
    // a fails; b succeeds and feeds c
    let provider = Arc::new(MarkedProvider::new(vec![
        ("job alpha", Duration::ZERO, failure("alpha exploded")),
        (
            "job beta",
            Duration::ZERO,
            Ok("```json\n{\"beta_result\": \"payload\"}\n```".into()),
        ),
    ]));
    let config = parallel_config(
        json!([
            {"name": "a", "description": "job alpha", "agent": "worker"},
            {"name": "b", "description": "job beta", "agent": "worker"},
            {"name": "c", "description": "job gamma", "agent": "worker", "depends_on": ["b"]}
        ]),
        "continue-all",
        2,
    );

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(config)
        .with_provider("default", provider.clone())
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let err = crew
        .run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("alpha exploded"));

    // despite the failure, the independent chain ran to completion
    assert_eq!(crew.graph().get("b").unwrap().status(), TaskStatus::Completed);
    let c = crew.graph().get("c").unwrap();
    assert_eq!(c.status(), TaskStatus::Completed);
    assert_eq!(c.get_input("beta_result").unwrap(), json!("payload"));
}

#[tokio::test]
async fn complete_running_stops_seeding_new_tasks() {
    // a fails immediately while b is in flight; c (unblocked by b) must
    // never be seeded afterwards
    let provider = Arc::new(MarkedProvider::new(vec![
        ("job alpha", Duration::ZERO, failure("alpha exploded")),
        ("job beta", Duration::from_millis(150), Ok("ok".into())),
    ]));
    let config = parallel_config(
        json!([
            {"name": "a", "description": "job alpha", "agent": "worker"},
            {"name": "b", "description": "job beta", "agent": "worker"},
            {"name": "c", "description": "job gamma", "agent": "worker", "depends_on": ["b"]}
        ]),
        "complete-running",
        2,
    );

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(config)
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let err = crew
        .run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("alpha exploded"));

    // the in-flight task finished normally
    assert_eq!(crew.graph().get("b").unwrap().status(), TaskStatus::Completed);
    // but nothing new was started after the failure
    assert_eq!(crew.graph().get("c").unwrap().status(), TaskStatus::Pending);
}

#[tokio::test]
async fn dependencies_never_start_before_parents_complete() {
    let provider = Arc::new(MarkedProvider::new(vec![
        ("stage one", Duration::from_millis(50), Ok("ok".into())),
    ]));
    let config = parallel_config(
        json!([
            {"name": "root1", "description": "stage one", "agent": "worker"},
            {"name": "root2", "description": "stage one", "agent": "worker"},
            {"name": "join", "description": "stage two", "agent": "worker",
             "depends_on": ["root1", "root2"]}
        ]),
        "fail-fast",
        4,
    );

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(config)
        .with_provider("default", provider.clone())
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    crew.run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap();

    let prompts = provider.prompts.lock().unwrap();
    let join_at = prompts.iter().position(|p| p.contains("stage two")).unwrap();
    let stage_one_count = prompts[..join_at]
        .iter()
        .filter(|p| p.contains("stage one"))
        .count();
    // both roots ran (and completed) before the join was even prompted
    assert_eq!(stage_one_count, 2);
}

#[tokio::test]
async fn cancelling_the_root_token_cancels_the_run() {
    let provider = Arc::new(MarkedProvider::new(vec![(
        "job alpha",
        Duration::from_secs(5),
        Ok("never delivered".into()),
    )]));
    let config = parallel_config(
        json!([{"name": "a", "description": "job alpha", "agent": "worker"}]),
        "fail-fast",
        1,
    );

    let workspace = tempfile::tempdir().unwrap();
    let crew = CrewBuilder::new(config)
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = crew.run(cancel, HashMap::new()).await.unwrap_err();
    assert!(err.is_cancellation());

    let runs = crew.state().list_runs(1).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Cancelled);
}
