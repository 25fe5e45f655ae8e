//! Checkpoint and resume behaviour.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cadre::config::CrewConfig;
use cadre::crew::CrewBuilder;
use cadre::error::CadreError;
use cadre::provider::{CompletionRequest, CompletionResponse, ProviderClient, StopReason};
use cadre::state::{RunStatus, SqliteStateStore};
use cadre::task::TaskStatus;

/// Succeeds on "implement" prompts, fails the first "review" prompt, then
/// succeeds.  Records every prompt.
struct HealingProvider {
    review_failed_once: AtomicBool,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl HealingProvider {
    fn new() -> Self {
        Self {
            review_failed_once: AtomicBool::new(false),
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProviderClient for HealingProvider {
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
        self.prompts.lock().unwrap().push(prompt.clone());

        if prompt.contains("review the patch")
            && !self.review_failed_once.swap(true, Ordering::SeqCst)
        {
            return Err(CadreError::Api {
                status: 400,
                message: "reviewer crashed".into(),
            });
        }
        if prompt.contains("implement the feature") {
            return Ok(CompletionResponse::text(
                "```json\n{\"patch\": \"the diff\"}\n```",
                StopReason::EndTurn,
            ));
        }
        Ok(CompletionResponse::text("approved", StopReason::EndTurn))
    }

    fn model_name(&self) -> &str {
        "healing-mock"
    }
}

fn pipeline_config() -> CrewConfig {
    serde_json::from_value(json!({
        "name": "pipeline",
        "agents": [
            {"name": "dev", "role": "Developer"},
            {"name": "rev", "role": "Reviewer"}
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
async fn resume_skips_completed_tasks_and_finishes_the_run() {
    let provider = Arc::new(HealingProvider::new());
    let workspace = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteStateStore::open(workspace.path().join(".cadre").join("state.db")).unwrap(),
    );

    let crew = CrewBuilder::new(pipeline_config())
        .with_provider("default", provider.clone())
        .with_state_store(store)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    // first run: impl completes, review fails, a checkpoint is mirrored
    let err = crew
        .run(CancellationToken::new(), HashMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("reviewer crashed"));

    let mirror = workspace.path().join(".cadre").join("checkpoints");
    let checkpoint_id = std::fs::read_dir(&mirror)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path()
        .file_stem()
        .unwrap()
        .to_string_lossy()
        .to_string();

    // resume: only the failed task re-runs, and the run completes
    let outcome = crew
        .resume(CancellationToken::new(), &checkpoint_id)
        .await
        .unwrap();

    let run = crew.state().get_run(&outcome.run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(crew.graph().get("review").unwrap().status(), TaskStatus::Completed);

    // impl executed exactly once across both runs
    let prompts = provider.prompts.lock().unwrap();
    let impl_runs = prompts
        .iter()
        .filter(|p| p.contains("implement the feature"))
        .count();
    assert_eq!(impl_runs, 1);

    // the restored review task still received impl's checkpointed outputs
    let review_prompt = prompts
        .iter()
        .rev()
        .find(|p| p.contains("review the patch"))
        .unwrap();
    assert!(review_prompt.contains("patch: the diff"));
}

#[tokio::test]
async fn explicit_checkpoints_capture_agent_memories() {
    let provider = Arc::new(HealingProvider::new());
    let workspace = tempfile::tempdir().unwrap();

    let crew = CrewBuilder::new(pipeline_config())
        .with_provider("default", provider)
        .with_workspace(workspace.path())
        .build()
        .await
        .unwrap();

    // seed some memory by talking to an agent directly
    let runtime = crew.runtime("dev").unwrap();
    runtime
        .execute(&CancellationToken::new(), "implement the feature please")
        .await
        .unwrap();

    crew.state()
        .start_run("pipeline", HashMap::new())
        .await
        .unwrap();
    let checkpoint_id = crew.checkpoint(Some("impl".to_string())).await.unwrap();

    let checkpoint = crew
        .state()
        .load_checkpoint(&checkpoint_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.current_task.as_deref(), Some("impl"));
    let dev_memory = &checkpoint.memories["dev"];
    assert!(dev_memory.iter().any(|m| m.content.contains("implement the feature")));
}
