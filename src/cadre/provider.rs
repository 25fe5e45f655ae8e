//! Provider-agnostic model client interface.
//!
//! The runtime never talks to a concrete vendor.  Everything it needs from a
//! model is captured by the [`ProviderClient`] trait: one request/response
//! completion call and one streaming variant.  Host applications implement
//! the trait (or inject an existing implementation) and register it under a
//! provider name with the crew builder.
//!
//! All implementations **must** be thread-safe (`Send + Sync`) so they can be
//! shared between agent runtimes via `Arc<dyn ProviderClient>`.
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use cadre::provider::{CompletionRequest, CompletionResponse, ProviderClient, StopReason};
//! use cadre::CadreError;
//!
//! struct CannedClient;
//!
//! #[async_trait]
//! impl ProviderClient for CannedClient {
//!     async fn complete(
//!         &self,
//!         _request: CompletionRequest,
//!     ) -> Result<CompletionResponse, CadreError> {
//!         Ok(CompletionResponse::text("ok", StopReason::EndTurn))
//!     }
//!
//!     fn model_name(&self) -> &str {
//!         "canned-1"
//!     }
//! }
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cadre::error::CadreError;
use crate::cadre::message::{ContentBlock, Message};

/// Provider-agnostic tool schema passed to the model with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the API tool catalog.
    pub name: String,
    /// Human-readable description surfaced to the model to aid selection.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// How many tokens were spent on prompt vs. completion?
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt/input tokens billed by the provider.
    pub input_tokens: usize,
    /// Generated/output tokens billed by the provider.
    pub output_tokens: usize,
    /// Convenience total equal to `input_tokens + output_tokens`.
    pub total_tokens: usize,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model finished its turn.
    EndTurn,
    /// The model wants one or more tools executed.
    ToolUse,
    /// The max-tokens cap was reached.
    MaxTokens,
    /// A configured stop sequence was hit.
    StopSequence,
}

/// A tool invocation requested by the model, extracted from `tool_use` blocks.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    /// Provider-assigned call id used to correlate the result.
    pub id: String,
    /// Name of the requested tool.
    pub name: String,
    /// Raw JSON arguments supplied by the model.
    pub input: serde_json::Value,
}

/// One completion request.
///
/// Bundles the system string, the ordered conversation, an optional tool
/// catalog, and generation caps.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    /// System priming string.
    pub system: String,
    /// Ordered conversation turns.
    pub messages: Vec<Message>,
    /// Tool catalog forwarded to the provider's native tool-calling API.
    pub tools: Option<Vec<ToolDefinition>>,
    /// Cap on generated tokens.
    pub max_tokens: usize,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional stop sequences.
    pub stop_sequences: Option<Vec<String>>,
}

/// One completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    /// Concatenated plain text of the reply.
    pub content: String,
    /// Structured blocks exactly as the provider returned them.
    pub content_blocks: Vec<ContentBlock>,
    /// Tool invocations the model requested this turn, in model order.
    pub tool_calls: Vec<ToolCallRequest>,
    /// Why generation stopped.
    pub stop_reason: StopReason,
    /// Token accounting for this call.
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// A plain-text response with no blocks or tool calls.
    pub fn text(content: impl Into<String>, stop_reason: StopReason) -> Self {
        let content = content.into();
        Self {
            content_blocks: vec![ContentBlock::text(content.clone())],
            content,
            tool_calls: Vec::new(),
            stop_reason,
            usage: TokenUsage::default(),
        }
    }

    /// Build a response from structured blocks, deriving `content` from the
    /// text blocks and `tool_calls` from the `tool_use` blocks in order.
    pub fn from_blocks(blocks: Vec<ContentBlock>, stop_reason: StopReason) -> Self {
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in &blocks {
            match block {
                ContentBlock::Text { text } => content.push_str(text),
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCallRequest {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                ContentBlock::ToolResult { .. } => {}
            }
        }
        Self {
            content,
            content_blocks: blocks,
            tool_calls,
            stop_reason,
            usage: TokenUsage::default(),
        }
    }

    /// Attach usage counters (builder pattern).
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// An incremental event from a streaming completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A piece of the assistant's text reply.
    ContentDelta(String),
}

/// Callback receiving [`StreamEvent`]s as they arrive.
pub type StreamHandler<'a> = &'a (dyn Fn(StreamEvent) + Send + Sync);

/// Trait-driven abstraction over a concrete model provider.
///
/// The trait deliberately excludes conversation bookkeeping (that lives in
/// [`Memory`](crate::cadre::memory::Memory)) and retries (that live in
/// [`RetryProvider`](crate::cadre::retry::RetryProvider)).
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send one request/response completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, CadreError>;

    /// Stream a completion, invoking `handler` for every incremental event.
    ///
    /// The final assembled response is still returned so callers get the same
    /// blocks and tool calls they would from [`complete`](Self::complete).
    /// Providers without streaming support inherit this default, which
    /// resolves the full completion and emits it as a single delta.
    async fn stream(
        &self,
        request: CompletionRequest,
        handler: StreamHandler<'_>,
    ) -> Result<CompletionResponse, CadreError> {
        let response = self.complete(request).await?;
        if !response.content.is_empty() {
            handler(StreamEvent::ContentDelta(response.content.clone()));
        }
        Ok(response)
    }

    /// Identifier used to select the upstream model (e.g. `"sonnet-large"`).
    fn model_name(&self) -> &str;
}
