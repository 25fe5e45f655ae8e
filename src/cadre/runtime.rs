//! Agent runtime loop.
//!
//! An [`AgentRuntime`] binds an [`Agent`] to a provider and a tool map and
//! drives the conversation: one prompt becomes many (content, tool-use,
//! tool-result) turns, bounded by `max_iterations`.
//!
//! One turn of the loop:
//!
//! 1. Build a completion request from the system prompt, the memory, and the
//!    tool catalog.
//! 2. Call the provider (through the retry decorator).
//! 3. If the response carries tool calls, preserve the assistant blocks in
//!    memory, execute every call in model order, fold the results into one
//!    `user` message of `tool_result` blocks, and loop.
//! 4. Otherwise record the assistant reply and return it.
//!
//! Tool failures never abort the turn: they are reported back to the model
//! as `is_error` tool results, and it is the model's decision to give up or
//! recover.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::cadre::agent::Agent;
use crate::cadre::error::CadreError;
use crate::cadre::memory::MemoryStore;
use crate::cadre::message::{ContentBlock, Message};
use crate::cadre::provider::{
    CompletionRequest, CompletionResponse, ProviderClient, StreamEvent, ToolCallRequest,
};
use crate::cadre::retry::{RetryConfig, RetryProvider};
use crate::cadre::tool::{definitions_for, Tool};

/// Default bound on provider round-trips per `execute` call.
pub const DEFAULT_MAX_ITERATIONS: usize = 10;

/// Default cap on generated tokens per provider call.
const DEFAULT_MAX_TOKENS: usize = 4_096;

/// A tool result produced outside the runtime, fed back in through
/// [`AgentRuntime::execute_with_tool_results`].
#[derive(Debug, Clone)]
pub struct ToolExecution {
    /// Id of the `tool_use` block this result answers.
    pub tool_use_id: String,
    /// Text result (or error text).
    pub content: String,
    /// Whether the execution failed.
    pub is_error: bool,
}

/// Counters for observability; cheap to read at any time.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    api_requests: AtomicU64,
    tool_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl RuntimeMetrics {
    /// Provider round-trips performed so far.
    pub fn api_requests(&self) -> u64 {
        self.api_requests.load(Ordering::Relaxed)
    }

    /// Tool calls executed so far.
    pub fn tool_calls(&self) -> u64 {
        self.tool_calls.load(Ordering::Relaxed)
    }

    /// Prompt tokens billed across all calls, as reported by the provider.
    pub fn input_tokens(&self) -> u64 {
        self.input_tokens.load(Ordering::Relaxed)
    }

    /// Generated tokens billed across all calls.
    pub fn output_tokens(&self) -> u64 {
        self.output_tokens.load(Ordering::Relaxed)
    }

    fn record_usage(&self, usage: &crate::cadre::provider::TokenUsage) {
        self.input_tokens
            .fetch_add(usage.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(usage.output_tokens as u64, Ordering::Relaxed);
    }
}

/// Callback receiving streamed text deltas.
pub type DeltaHandler<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Drives one agent's conversation loop.
pub struct AgentRuntime {
    agent: Agent,
    provider: RetryProvider,
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    max_iterations: AtomicUsize,
    max_tokens: usize,
    metrics: RuntimeMetrics,
}

impl AgentRuntime {
    /// Bind `agent` to a provider with the default retry configuration, no
    /// tools, and the default iteration bound.
    pub fn new(agent: Agent, provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            agent,
            provider: RetryProvider::new(provider),
            tools: RwLock::new(HashMap::new()),
            max_iterations: AtomicUsize::new(DEFAULT_MAX_ITERATIONS),
            max_tokens: DEFAULT_MAX_TOKENS,
            metrics: RuntimeMetrics::default(),
        }
    }

    /// Override the provider retry configuration (builder pattern).
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        let inner = self.provider.into_inner();
        self.provider = RetryProvider::with_config(inner, config);
        self
    }

    /// Override the iteration bound (builder pattern).
    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        self.max_iterations.store(max_iterations, Ordering::Relaxed);
        self
    }

    /// Override the per-call token cap (builder pattern).
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Grant the runtime an initial tool map (builder pattern).
    pub fn with_tools(mut self, tools: HashMap<String, Arc<dyn Tool>>) -> Self {
        self.tools = RwLock::new(tools);
        self
    }

    /// The agent this runtime drives.
    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Observability counters.
    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    /// Current iteration bound.
    pub fn max_iterations(&self) -> usize {
        self.max_iterations.load(Ordering::Relaxed)
    }

    /// Raise the iteration bound on a live runtime (used by the hierarchical
    /// coordinator, whose manager makes many tool calls per turn).
    pub fn set_max_iterations(&self, max_iterations: usize) {
        self.max_iterations.store(max_iterations, Ordering::Relaxed);
    }

    /// Inject additional tools at runtime (coordinator-injected synthetic
    /// tools land here).  Existing names are replaced.
    pub async fn add_tools(&self, tools: HashMap<String, Arc<dyn Tool>>) {
        self.tools.write().await.extend(tools);
    }

    /// Attach a durable memory store to this agent's memory under `namespace`.
    pub async fn set_memory_store(
        &self,
        store: Arc<dyn MemoryStore>,
        namespace: impl Into<String>,
    ) -> Result<(), CadreError> {
        self.agent.memory.attach_store(store, namespace).await
    }

    /// Run one prompt to completion.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<String, CadreError> {
        self.agent.memory.append(Message::user(prompt)).await;
        self.drive(cancel, 0, None).await
    }

    /// Run one prompt to completion, emitting text deltas via `on_delta`.
    pub async fn stream_execute(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        on_delta: DeltaHandler<'_>,
    ) -> Result<String, CadreError> {
        self.agent.memory.append(Message::user(prompt)).await;
        self.drive(cancel, 0, Some(on_delta)).await
    }

    /// Continue the loop after a coordinator has produced tool results
    /// externally.  `depth` counts iterations already consumed and shares the
    /// iteration budget with the main loop.
    pub async fn execute_with_tool_results(
        &self,
        cancel: &CancellationToken,
        results: Vec<ToolExecution>,
        depth: usize,
    ) -> Result<String, CadreError> {
        let blocks: Vec<ContentBlock> = results
            .into_iter()
            .map(|r| ContentBlock::tool_result(r.tool_use_id, r.content, r.is_error))
            .collect();
        self.agent
            .memory
            .append(Message::new(crate::cadre::message::Role::User, "").with_blocks(blocks))
            .await;
        self.drive(cancel, depth, None).await
    }

    /// The shared prompt → model → tools loop.
    async fn drive(
        &self,
        cancel: &CancellationToken,
        start_iteration: usize,
        on_delta: Option<DeltaHandler<'_>>,
    ) -> Result<String, CadreError> {
        let max_iterations = self.max_iterations();
        let mut iteration = start_iteration;

        while iteration < max_iterations {
            if cancel.is_cancelled() {
                return Err(CadreError::Cancelled);
            }

            let request = self.build_request().await;
            self.metrics.api_requests.fetch_add(1, Ordering::Relaxed);

            let response = match on_delta {
                Some(delta) => {
                    let handler = |event: StreamEvent| {
                        let StreamEvent::ContentDelta(text) = event;
                        delta(&text);
                    };
                    self.provider.stream(cancel, request, &handler).await?
                }
                None => self.provider.complete(cancel, request).await?,
            };
            self.metrics.record_usage(&response.usage);

            if !response.tool_calls.is_empty() {
                self.handle_tool_turn(&response).await;
                iteration += 1;
                continue;
            }

            self.agent
                .memory
                .append(Message::assistant(response.content.clone()))
                .await;
            return Ok(response.content);
        }

        Err(CadreError::IterationExhausted {
            scope: format!("agent '{}' loop", self.agent.name),
            limit: max_iterations,
        })
    }

    /// Preserve the assistant's structured blocks, execute every requested
    /// tool in model order, and fold the results into one `user` message.
    async fn handle_tool_turn(&self, response: &CompletionResponse) {
        self.agent
            .memory
            .append(
                Message::assistant(response.content.clone())
                    .with_blocks(response.content_blocks.clone()),
            )
            .await;

        let mut result_blocks = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            let (content, is_error) = self.run_tool(call).await;
            self.metrics.tool_calls.fetch_add(1, Ordering::Relaxed);
            result_blocks.push(ContentBlock::tool_result(call.id.clone(), content, is_error));
        }

        self.agent
            .memory
            .append(
                Message::new(crate::cadre::message::Role::User, "").with_blocks(result_blocks),
            )
            .await;
    }

    /// Execute one tool call.  Unknown names and handler failures become
    /// `is_error` results rather than turn-level errors.
    async fn run_tool(&self, call: &ToolCallRequest) -> (String, bool) {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(&call.name).cloned()
        };
        match tool {
            Some(tool) => match tool.execute(&call.input).await {
                Ok(result) => (result, false),
                Err(err) => {
                    log::warn!(
                        "tool '{}' failed for agent '{}': {}",
                        call.name,
                        self.agent.name,
                        err
                    );
                    (err.to_string(), true)
                }
            },
            None => {
                let err = CadreError::UnknownTool {
                    tool: call.name.clone(),
                };
                (err.to_string(), true)
            }
        }
    }

    /// Assemble the completion request for the current memory state.
    async fn build_request(&self) -> CompletionRequest {
        let tools = self.tools.read().await;
        let catalog = if tools.is_empty() {
            None
        } else {
            Some(definitions_for(&tools))
        };
        CompletionRequest {
            system: self.agent.system_prompt(),
            messages: self.agent.memory.messages().await,
            tools: catalog,
            max_tokens: self.max_tokens,
            temperature: None,
            stop_sequences: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadre::message::Role;
    use crate::cadre::provider::StopReason;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Provider that plays back a scripted list of responses.
    struct ScriptedProvider {
        responses: Mutex<Vec<CompletionResponse>>,
    }

    impl ScriptedProvider {
        fn new(mut responses: Vec<CompletionResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, CadreError> {
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| CadreError::state("script exhausted"))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct UppercaseTool;

    #[async_trait]
    impl Tool for UppercaseTool {
        fn name(&self) -> &str {
            "uppercase"
        }
        fn description(&self) -> &str {
            "Uppercases text."
        }
        fn parameters_schema(&self) -> serde_json::Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
            Ok(input["text"].as_str().unwrap_or_default().to_uppercase())
        }
    }

    fn tool_use_response(id: &str, name: &str, input: serde_json::Value) -> CompletionResponse {
        CompletionResponse::from_blocks(
            vec![
                ContentBlock::text("using a tool"),
                ContentBlock::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input,
                },
            ],
            StopReason::ToolUse,
        )
    }

    fn runtime_with(
        responses: Vec<CompletionResponse>,
        tools: Vec<Arc<dyn Tool>>,
    ) -> AgentRuntime {
        let agent = Agent::new("dev", "Developer", "finish the task", "");
        let map: HashMap<String, Arc<dyn Tool>> = tools
            .into_iter()
            .map(|t| (t.name().to_string(), t))
            .collect();
        AgentRuntime::new(agent, Arc::new(ScriptedProvider::new(responses))).with_tools(map)
    }

    #[tokio::test]
    async fn plain_reply_round_trip() {
        let runtime = runtime_with(
            vec![CompletionResponse::text("done", StopReason::EndTurn)],
            vec![],
        );
        let cancel = CancellationToken::new();
        let reply = runtime.execute(&cancel, "do the thing").await.unwrap();
        assert_eq!(reply, "done");
        assert_eq!(runtime.metrics().api_requests(), 1);

        let messages = runtime.agent().memory.messages().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn tool_turn_folds_results_and_continues() {
        let runtime = runtime_with(
            vec![
                tool_use_response("tc_1", "uppercase", json!({"text": "hi"})),
                CompletionResponse::text("said HI", StopReason::EndTurn),
            ],
            vec![Arc::new(UppercaseTool)],
        );
        let cancel = CancellationToken::new();
        let reply = runtime.execute(&cancel, "shout").await.unwrap();
        assert_eq!(reply, "said HI");
        assert_eq!(runtime.metrics().api_requests(), 2);
        assert_eq!(runtime.metrics().tool_calls(), 1);

        let messages = runtime.agent().memory.messages().await;
        // user prompt, assistant tool_use, user tool_result, assistant reply
        assert_eq!(messages.len(), 4);
        assert!(messages[1].has_tool_use());
        let blocks = messages[2].content_blocks.as_ref().unwrap();
        assert_eq!(
            blocks[0],
            ContentBlock::tool_result("tc_1", "HI", false)
        );
    }

    #[tokio::test]
    async fn unknown_tool_becomes_error_result() {
        let runtime = runtime_with(
            vec![
                tool_use_response("tc_1", "no_such_tool", json!({})),
                CompletionResponse::text("recovered", StopReason::EndTurn),
            ],
            vec![],
        );
        let cancel = CancellationToken::new();
        let reply = runtime.execute(&cancel, "go").await.unwrap();
        assert_eq!(reply, "recovered");

        let messages = runtime.agent().memory.messages().await;
        let blocks = messages[2].content_blocks.as_ref().unwrap();
        match &blocks[0] {
            ContentBlock::ToolResult { is_error, content, .. } => {
                assert_eq!(*is_error, Some(true));
                assert!(content.contains("unknown tool"));
            }
            other => panic!("expected tool_result, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn iteration_exhaustion_carries_remediation() {
        // every response asks for another tool call, so the loop never ends
        let responses: Vec<CompletionResponse> = (0..12)
            .map(|i| tool_use_response(&format!("tc_{}", i), "uppercase", json!({"text": "x"})))
            .collect();
        let runtime = runtime_with(responses, vec![Arc::new(UppercaseTool)]);
        let cancel = CancellationToken::new();

        let err = runtime.execute(&cancel, "loop forever").await.unwrap_err();
        assert_eq!(err.code(), "iteration_exhausted");
        assert!(err.remediation().is_some());
        // the bound caps provider calls
        assert_eq!(runtime.metrics().api_requests(), DEFAULT_MAX_ITERATIONS as u64);
    }

    #[tokio::test]
    async fn continuation_shares_iteration_budget() {
        let runtime = runtime_with(
            vec![CompletionResponse::text("after results", StopReason::EndTurn)],
            vec![],
        );
        runtime.set_max_iterations(3);
        let cancel = CancellationToken::new();

        let reply = runtime
            .execute_with_tool_results(
                &cancel,
                vec![ToolExecution {
                    tool_use_id: "tc_ext".into(),
                    content: "external result".into(),
                    is_error: false,
                }],
                2,
            )
            .await
            .unwrap();
        assert_eq!(reply, "after results");

        // depth at the bound leaves no budget
        let err = runtime
            .execute_with_tool_results(&cancel, vec![], 3)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "iteration_exhausted");
    }

    #[tokio::test]
    async fn token_usage_accumulates_across_calls() {
        use crate::cadre::provider::TokenUsage;

        let usage = TokenUsage {
            input_tokens: 120,
            output_tokens: 30,
            total_tokens: 150,
        };
        let runtime = runtime_with(
            vec![
                tool_use_response("tc_1", "uppercase", json!({"text": "x"})).with_usage(usage),
                CompletionResponse::text("done", StopReason::EndTurn).with_usage(usage),
            ],
            vec![Arc::new(UppercaseTool)],
        );
        let cancel = CancellationToken::new();
        runtime.execute(&cancel, "count me").await.unwrap();

        assert_eq!(runtime.metrics().input_tokens(), 240);
        assert_eq!(runtime.metrics().output_tokens(), 60);
    }

    #[tokio::test]
    async fn stream_execute_emits_deltas() {
        let runtime = runtime_with(
            vec![CompletionResponse::text("streamed", StopReason::EndTurn)],
            vec![],
        );
        let cancel = CancellationToken::new();
        let seen = Mutex::new(String::new());
        let on_delta = |delta: &str| seen.lock().unwrap().push_str(delta);

        let reply = runtime
            .stream_execute(&cancel, "stream it", &on_delta)
            .await
            .unwrap();
        assert_eq!(reply, "streamed");
        assert_eq!(*seen.lock().unwrap(), "streamed");
    }
}
