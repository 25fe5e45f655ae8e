//! Agent definition.
//!
//! An [`Agent`] is immutable configuration (name, role, goal, backstory)
//! plus the list of tool names it may invoke and its [`Memory`].  The system
//! prompt is a deterministic function of that configuration, so two agents
//! built from the same declaration always prime the model identically.

use std::sync::Arc;

use crate::cadre::memory::{Memory, MemoryType};

/// Default token budget for an agent's conversation memory.
pub const DEFAULT_MEMORY_TOKENS: usize = 8_000;

/// An LLM persona with identity, tools, and memory.
pub struct Agent {
    /// Unique name within the crew.
    pub name: String,
    /// Short role descriptor (e.g. `"Senior Developer"`).
    pub role: String,
    /// What the agent is trying to achieve.
    pub goal: String,
    /// Background colour that shapes the agent's voice.
    pub backstory: String,
    /// Names of the tools this agent may invoke.
    pub tools: Vec<String>,
    /// Conversation memory.
    pub memory: Arc<Memory>,
}

impl Agent {
    /// Create an agent with the mandatory identity fields and a default
    /// conversation memory.
    pub fn new(
        name: impl Into<String>,
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
            tools: Vec::new(),
            memory: Arc::new(Memory::new(MemoryType::Conversation, DEFAULT_MEMORY_TOKENS)),
        }
    }

    /// Declare the tool names this agent may use (builder pattern).
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    /// Replace the default memory (builder pattern).
    pub fn with_memory(mut self, memory: Arc<Memory>) -> Self {
        self.memory = memory;
        self
    }

    /// Deterministic system prompt derived from the configuration.
    pub fn system_prompt(&self) -> String {
        let mut prompt = format!("You are {}, {}.", self.name, self.role);
        if !self.goal.is_empty() {
            prompt.push_str(&format!("\n\nYour goal: {}", self.goal));
        }
        if !self.backstory.is_empty() {
            prompt.push_str(&format!("\n\nBackstory: {}", self.backstory));
        }
        prompt.push_str(
            "\n\nComplete the task you are given. Use the available tools when they help. \
             When you produce structured results, wrap them in a fenced ```json code block \
             so they can be passed to dependent tasks.",
        );
        prompt
    }
}
