//! Crew configuration model.
//!
//! These serde structs are the in-memory form of a crew declaration.  The
//! file format and loader (YAML on disk, project scaffolding) live outside
//! the core; anything that can deserialize into [`CrewConfig`] can run.
//!
//! Validation happens once, at load time: unknown agent references, unknown
//! dependencies, out-of-range iteration bounds, and unparseable durations
//! are all fatal configuration errors.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cadre::coordinator::ErrorStrategy;
use crate::cadre::error::CadreError;
use crate::cadre::event::EventType;
use crate::cadre::memory::MemoryType;
use crate::cadre::task::{BackoffKind, TaskRetry};

/// Upper bound on `max_iterations`.
pub const MAX_ITERATIONS_LIMIT: u32 = 100;

/// Declared process discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Sequential,
    Parallel,
    Hierarchical,
    Iterative,
}

impl Default for ProcessKind {
    fn default() -> Self {
        ProcessKind::Sequential
    }
}

/// Parse a human duration string: `"250ms"`, `"30s"`, `"5m"`, `"2h"`.
pub fn parse_duration(s: &str) -> Result<Duration, CadreError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| CadreError::config(format!("duration '{}' is missing a unit", s)))?;
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| CadreError::config(format!("invalid duration '{}'", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(CadreError::config(format!(
            "invalid duration unit in '{}' (expected ms, s, m, or h)",
            s
        ))),
    }
}

fn default_memory_tokens() -> usize {
    crate::cadre::agent::DEFAULT_MEMORY_TOKENS
}

/// Per-agent memory declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// `conversation`, `long_term`, or `shared`.
    #[serde(rename = "type", default)]
    pub memory_type: MemoryType,
    /// Token budget for truncation.
    #[serde(default = "default_memory_tokens")]
    pub max_tokens: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_type: MemoryType::Conversation,
            max_tokens: default_memory_tokens(),
        }
    }
}

/// Retry declaration shared by agents (provider retries) and tasks
/// (executor retries).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffKind,
}

impl From<RetryPolicyConfig> for TaskRetry {
    fn from(config: RetryPolicyConfig) -> Self {
        TaskRetry {
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff,
        }
    }
}

/// One agent declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    pub role: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub backstory: String,
    /// Provider name; falls back to the crew default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Model identifier forwarded to the provider client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Credential override; absent means the host environment supplies it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Workspace override for this agent's tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub tools: Vec<String>,
    /// Turn timeout (duration string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Provider retry policy for this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyConfig>,
}

/// One task declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub description: String,
    /// Agent assigned to run the task.
    pub agent: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub inputs: std::collections::HashMap<String, serde_json::Value>,
    /// Per-task deadline (duration string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicyConfig>,
}

/// How a declared tool executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolKind {
    /// A shell command; the tool input arrives as `CADRE_TOOL_INPUT`.
    Command { command: String },
    /// An HTTP call carrying the tool input as JSON.
    Http { method: String, url: String },
}

/// One configured (non-built-in) tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(flatten)]
    pub kind: ToolKind,
}

/// One configured event-bus hook.
///
/// An empty `events` list subscribes the hook to every lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookConfig {
    /// Run a shell command per event (`CADRE_EVENT_TYPE` / `CADRE_EVENT_JSON`).
    Shell {
        name: String,
        command: String,
        #[serde(default)]
        blocking: bool,
        #[serde(default)]
        events: Vec<EventType>,
    },
    /// POST each event as JSON to a URL.
    Webhook {
        name: String,
        url: String,
        #[serde(default)]
        blocking: bool,
        #[serde(default)]
        events: Vec<EventType>,
    },
    /// Write a structured log line per event.  Never blocking.
    Log {
        name: String,
        #[serde(default = "default_log_level")]
        level: String,
        #[serde(default)]
        events: Vec<EventType>,
    },
    /// Human-in-the-loop gate.  Always blocking.
    Pause {
        name: String,
        message: String,
        #[serde(default)]
        events: Vec<EventType>,
    },
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Parse a configured log level name.
pub fn parse_log_level(level: &str) -> Result<log::Level, CadreError> {
    match level.to_ascii_lowercase().as_str() {
        "error" => Ok(log::Level::Error),
        "warn" => Ok(log::Level::Warn),
        "info" => Ok(log::Level::Info),
        "debug" => Ok(log::Level::Debug),
        "trace" => Ok(log::Level::Trace),
        other => Err(CadreError::config(format!(
            "invalid log level '{}' (expected error, warn, info, debug, or trace)",
            other
        ))),
    }
}

/// A whole crew declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrewConfig {
    pub name: String,
    #[serde(default)]
    pub process: ProcessKind,
    /// Manager agent; required for the hierarchical process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manager: Option<String>,
    pub agents: Vec<AgentConfig>,
    pub tasks: Vec<TaskConfig>,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
    /// Positive value activates the iterative process.
    #[serde(default)]
    pub max_iterations: u32,
    /// Parallel worker count; `0` resolves to the CPU count.
    #[serde(default)]
    pub concurrency: usize,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Crew-level deadline (duration string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Default provider name for agents that do not declare one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Default model identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl CrewConfig {
    /// The process that will actually run: a positive `max_iterations` wins
    /// over the declared process.
    pub fn effective_process(&self) -> ProcessKind {
        if self.max_iterations > 0 {
            ProcessKind::Iterative
        } else {
            self.process
        }
    }

    /// Load-time validation of the whole declaration.
    pub fn validate(&self) -> Result<(), CadreError> {
        if self.name.is_empty() {
            return Err(CadreError::config("crew name must not be empty"));
        }
        if self.agents.is_empty() {
            return Err(CadreError::config("crew declares no agents"));
        }
        if self.tasks.is_empty() {
            return Err(CadreError::config("crew declares no tasks"));
        }

        let mut agent_names = HashSet::new();
        for agent in &self.agents {
            if !agent_names.insert(agent.name.as_str()) {
                return Err(CadreError::config(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            if let Some(timeout) = &agent.timeout {
                parse_duration(timeout)?;
            }
        }

        let mut task_names = HashSet::new();
        for task in &self.tasks {
            if !task_names.insert(task.name.as_str()) {
                return Err(CadreError::config(format!(
                    "duplicate task name '{}'",
                    task.name
                )));
            }
            if !agent_names.contains(task.agent.as_str()) {
                return Err(CadreError::config(format!(
                    "task '{}' references unknown agent '{}'",
                    task.name, task.agent
                )));
            }
            for dep in &task.depends_on {
                if !self.tasks.iter().any(|t| &t.name == dep) {
                    return Err(CadreError::config(format!(
                        "task '{}' depends on unknown task '{}'",
                        task.name, dep
                    )));
                }
            }
            if let Some(timeout) = &task.timeout {
                parse_duration(timeout)?;
            }
        }

        if self.max_iterations > MAX_ITERATIONS_LIMIT {
            return Err(CadreError::config(format!(
                "max_iterations {} exceeds the limit of {}",
                self.max_iterations, MAX_ITERATIONS_LIMIT
            )));
        }
        if self.process == ProcessKind::Iterative && self.max_iterations == 0 {
            return Err(CadreError::config(
                "iterative process requires max_iterations >= 1",
            ));
        }

        if self.effective_process() == ProcessKind::Hierarchical {
            let manager = self.manager.as_deref().ok_or_else(|| {
                CadreError::config("hierarchical process requires a manager agent")
            })?;
            if !agent_names.contains(manager) {
                return Err(CadreError::config(format!(
                    "manager '{}' is not in the crew's agent list",
                    manager
                )));
            }
        }

        for hook in &self.hooks {
            if let HookConfig::Log { level, .. } = hook {
                parse_log_level(level)?;
            }
        }

        if let Some(timeout) = &self.timeout {
            parse_duration(timeout)?;
        }
        Ok(())
    }
}
