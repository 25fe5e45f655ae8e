//! Tool abstraction and registry.
//!
//! A [`Tool`] is a named, schema-bearing callable unit.  The model sees the
//! name, description, and JSON-shape parameter schema; the runtime routes
//! each `tool_use` block through the [`ToolRegistry`] and folds the text
//! result (or error) back into the conversation.
//!
//! Built-in tools (file read/write, shell, grep) ship with the core; see the
//! [`tools`](crate::cadre::tools) module.  Additional tools are materialised
//! from configuration as shell-command invocations or HTTP calls.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use cadre::tool::{Tool, ToolRegistry};
//! use cadre::CadreError;
//!
//! struct EchoTool;
//!
//! #[async_trait]
//! impl Tool for EchoTool {
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!     fn description(&self) -> &str {
//!         "Echoes its input back."
//!     }
//!     fn parameters_schema(&self) -> serde_json::Value {
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": {"text": {"type": "string"}},
//!             "required": ["text"]
//!         })
//!     }
//!     async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError> {
//!         Ok(input["text"].as_str().unwrap_or_default().to_string())
//!     }
//! }
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(EchoTool)).unwrap();
//! assert!(registry.get("echo").is_ok());
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cadre::error::CadreError;
use crate::cadre::provider::ToolDefinition;

/// A named callable unit an agent may invoke.
///
/// `execute` takes the raw JSON the model supplied and returns a text result.
/// Implementations should be idempotent where possible; the runtime does not
/// deduplicate repeated calls.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name as surfaced to the model.
    fn name(&self) -> &str;

    /// Human-readable description surfaced to the model.
    fn description(&self) -> &str;

    /// JSON Schema object describing the accepted parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool against raw JSON input.
    async fn execute(&self, input: &serde_json::Value) -> Result<String, CadreError>;
}

impl std::fmt::Debug for dyn Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool").field("name", &self.name()).finish()
    }
}

/// Name → tool mapping with unique-name registration.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.  Fails when a tool with the same name already exists.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), CadreError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(CadreError::config(format!(
                "tool '{}' is already registered",
                name
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    /// Look up a tool by name.  Unknown names fail with a distinguishable
    /// [`CadreError::UnknownTool`].
    pub fn get(&self, name: &str) -> Result<Arc<dyn Tool>, CadreError> {
        self.tools
            .get(name)
            .cloned()
            .ok_or_else(|| CadreError::UnknownTool { tool: name.into() })
    }

    /// Whether a tool with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Select a subset of tools by name, preserving the requested order.
    pub fn select(&self, names: &[String]) -> Result<HashMap<String, Arc<dyn Tool>>, CadreError> {
        let mut selected = HashMap::new();
        for name in names {
            let tool = self.get(name)?;
            selected.insert(name.clone(), tool);
        }
        Ok(selected)
    }

    /// Provider tool catalog for the registered tools, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters_schema: tool.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}

/// Build the tool catalog for an arbitrary tool map (used by the runtime,
/// which owns its tools directly).
pub fn definitions_for(tools: &HashMap<String, Arc<dyn Tool>>) -> Vec<ToolDefinition> {
    let mut defs: Vec<ToolDefinition> = tools
        .values()
        .map(|tool| ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters_schema: tool.parameters_schema(),
        })
        .collect();
    defs.sort_by(|a, b| a.name.cmp(&b.name));
    defs
}
