//! Single-task execution.
//!
//! The executor turns one [`Task`] into one agent runtime call: it composes
//! the prompt from the description and inputs, applies the task's timeout as
//! a deadline, retries per the task's policy, and extracts structured
//! outputs from the reply.
//!
//! Output extraction is lenient by design: the first fenced ```json block in
//! the reply becomes the task's outputs; when there is no well-formed block
//! the whole reply lands under the reserved `_response` key.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::cadre::error::CadreError;
use crate::cadre::runtime::AgentRuntime;
use crate::cadre::task::{Task, MANAGER_PREFIX, RESPONSE_KEY};

/// Default base delay between task retry attempts.
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Executes tasks against agent runtimes.
pub struct TaskExecutor {
    base_delay: Duration,
}

impl Default for TaskExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutor {
    /// Create an executor with the default retry base delay.
    pub fn new() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Override the retry base delay (builder pattern; tests shrink it).
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Run `task` on `runtime` to a terminal state.
    ///
    /// On success the task is `completed` with extracted outputs; on final
    /// failure it is `failed` with the error string, which is also returned.
    /// Cancellation and elapsed deadlines are never retried.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        task: &Arc<Task>,
        runtime: &Arc<AgentRuntime>,
    ) -> Result<(), CadreError> {
        task.start()?;
        let prompt = compose_prompt(task);

        loop {
            let attempt = task.record_attempt();
            let result = match task.timeout {
                Some(timeout) => match tokio::time::timeout(
                    timeout,
                    runtime.execute(cancel, &prompt),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(CadreError::DeadlineExceeded),
                },
                None => runtime.execute(cancel, &prompt).await,
            };

            match result {
                Ok(reply) => {
                    let outputs = extract_structured_outputs(&reply);
                    task.complete(outputs)?;
                    return Ok(());
                }
                Err(err) if err.is_cancellation() => {
                    task.fail(err.to_string())?;
                    return Err(err);
                }
                Err(err) => {
                    if attempt < task.retry.max_attempts {
                        let delay = task.retry.delay(self.base_delay, attempt);
                        log::warn!(
                            "task '{}' attempt {}/{} failed: {}; retrying in {:?}",
                            task.name,
                            attempt,
                            task.retry.max_attempts,
                            err,
                            delay
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                task.fail(CadreError::Cancelled.to_string())?;
                                return Err(CadreError::Cancelled);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    task.fail(err.to_string())?;
                    return Err(err);
                }
            }
        }
    }
}

/// Compose the task prompt: description, the non-reserved inputs, and any
/// manager channels last.
pub fn compose_prompt(task: &Task) -> String {
    let inputs = task.inputs();
    let mut prompt = task.description.clone();

    let mut regular: Vec<(&String, &serde_json::Value)> = inputs
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .collect();
    regular.sort_by(|a, b| a.0.cmp(b.0));
    if !regular.is_empty() {
        prompt.push_str("\n\nInputs:");
        for (key, value) in regular {
            prompt.push_str(&format!("\n- {}: {}", key, render_value(value)));
        }
    }

    let mut channels: Vec<(&String, &serde_json::Value)> = inputs
        .iter()
        .filter(|(k, _)| k.starts_with(MANAGER_PREFIX))
        .collect();
    channels.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in channels {
        let label = key.trim_start_matches(MANAGER_PREFIX).replace('_', " ");
        prompt.push_str(&format!("\n\nManager {}: {}", label, render_value(value)));
    }

    prompt
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Scan `reply` for the first fenced JSON block (case-insensitive language
/// tag) and return its top-level keys as outputs; otherwise `{_response}`.
pub fn extract_structured_outputs(reply: &str) -> HashMap<String, serde_json::Value> {
    if let Some(body) = first_json_fence(reply) {
        if let Ok(serde_json::Value::Object(object)) =
            serde_json::from_str::<serde_json::Value>(body)
        {
            return object.into_iter().collect();
        }
    }
    let mut outputs = HashMap::new();
    outputs.insert(
        RESPONSE_KEY.to_string(),
        serde_json::Value::String(reply.to_string()),
    );
    outputs
}

/// Find the body of the first ```json fenced block.
fn first_json_fence(reply: &str) -> Option<&str> {
    let mut search_from = 0;
    while let Some(start) = reply[search_from..].find("```") {
        let tag_start = search_from + start + 3;
        let rest = &reply[tag_start..];
        let newline = rest.find('\n')?;
        let tag = rest[..newline].trim();
        let body_start = tag_start + newline + 1;
        let body_end = reply[body_start..].find("```")? + body_start;
        if tag.eq_ignore_ascii_case("json") {
            return Some(&reply[body_start..body_end]);
        }
        search_from = body_end + 3;
    }
    None
}
