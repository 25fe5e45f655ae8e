//! Crew orchestrator.
//!
//! [`CrewBuilder`] turns a validated [`CrewConfig`] plus injected provider
//! clients into a runnable [`Crew`]: one agent runtime per agent, a
//! validated task graph, a state manager, and an event bus.  [`Crew::run`]
//! selects the coordinator for the declared process discipline, emits the
//! crew lifecycle events, and records every outcome durably.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cadre::config::CrewConfig;
//! use cadre::crew::CrewBuilder;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(config: CrewConfig, client: Arc<dyn cadre::provider::ProviderClient>) -> Result<(), cadre::CadreError> {
//! let crew = CrewBuilder::new(config)
//!     .with_provider("anthropic", client)
//!     .build()
//!     .await?;
//!
//! let outcome = crew.run(CancellationToken::new(), Default::default()).await?;
//! println!("run {} finished: {:?}", outcome.run_id, outcome.outputs);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::cadre::agent::Agent;
use crate::cadre::config::{parse_duration, parse_log_level, CrewConfig, HookConfig, ProcessKind};
use crate::cadre::coordinator::{
    Coordinator, HierarchicalCoordinator, IterativeCoordinator, ParallelCoordinator, RunContext,
    SequentialCoordinator,
};
use crate::cadre::error::CadreError;
use crate::cadre::event::{Event, EventBus, EventType, Hook};
use crate::cadre::executor::TaskExecutor;
use crate::cadre::graph::TaskGraph;
use crate::cadre::hooks::{LogHook, PauseHook, ShellHook, WebhookHook};
use crate::cadre::memory::{Memory, MemoryStore, MemoryType};
use crate::cadre::message::Message;
use crate::cadre::provider::ProviderClient;
use crate::cadre::retry::RetryConfig;
use crate::cadre::runtime::AgentRuntime;
use crate::cadre::state::{MemoryStateStore, StateManager, StateStore};
use crate::cadre::task::{propagates, Task, TaskStatus};
use crate::cadre::tools::{builtin_registry, custom};

/// Provider name used when neither the crew nor the agent declares one.
const DEFAULT_PROVIDER: &str = "default";

/// Injected provider clients, keyed by the names configuration refers to.
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client under a provider name.
    pub fn register(&mut self, name: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.providers.insert(name.into(), client);
    }

    /// Resolve a provider name; absence is a missing-credential error with a
    /// remediation hint.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProviderClient>, CadreError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| CadreError::MissingCredential {
                provider: name.to_string(),
            })
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Id of the durably recorded run.
    pub run_id: String,
    /// Union of leaf-task outputs.
    pub outputs: HashMap<String, serde_json::Value>,
}

/// Assembles a runnable [`Crew`].
pub struct CrewBuilder {
    config: CrewConfig,
    providers: ProviderRegistry,
    state_store: Option<Arc<dyn StateStore>>,
    memory_store: Option<Arc<dyn MemoryStore>>,
    bus: Option<Arc<EventBus>>,
    workspace: PathBuf,
}

impl CrewBuilder {
    pub fn new(config: CrewConfig) -> Self {
        Self {
            config,
            providers: ProviderRegistry::new(),
            state_store: None,
            memory_store: None,
            bus: None,
            workspace: PathBuf::from("."),
        }
    }

    /// Register a provider client (builder pattern).
    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.providers.register(name, client);
        self
    }

    /// Use a pre-populated provider registry (builder pattern).
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Back run state with a specific store (defaults to in-memory).
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    /// Back long-term and shared memories with a durable store.
    pub fn with_memory_store(mut self, store: Arc<dyn MemoryStore>) -> Self {
        self.memory_store = Some(store);
        self
    }

    /// Use an existing event bus (hooks may already be registered on it).
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Workspace directory for built-in tools and the checkpoint mirror.
    pub fn with_workspace(mut self, workspace: impl Into<PathBuf>) -> Self {
        self.workspace = workspace.into();
        self
    }

    /// Validate the configuration and assemble the crew.
    pub async fn build(self) -> Result<Crew, CadreError> {
        let config = self.config;
        config.validate()?;

        let default_provider = config
            .provider
            .clone()
            .unwrap_or_else(|| DEFAULT_PROVIDER.to_string());

        let mut runtimes: HashMap<String, Arc<AgentRuntime>> = HashMap::new();
        for agent_config in &config.agents {
            let provider_name = agent_config
                .provider
                .clone()
                .unwrap_or_else(|| default_provider.clone());
            let client = self.providers.resolve(&provider_name)?;

            let workspace = agent_config
                .work_dir
                .clone()
                .unwrap_or_else(|| self.workspace.clone());
            let mut registry = builtin_registry(&workspace)?;
            for tool_config in &config.tools {
                registry.register(custom::materialize(tool_config, &workspace))?;
            }
            let tools = registry.select(&agent_config.tools)?;

            let memory = Arc::new(Memory::new(
                agent_config.memory.memory_type,
                agent_config.memory.max_tokens,
            ));
            let agent = Agent::new(
                &agent_config.name,
                &agent_config.role,
                &agent_config.goal,
                &agent_config.backstory,
            )
            .with_tools(agent_config.tools.clone())
            .with_memory(Arc::clone(&memory));

            let mut runtime = AgentRuntime::new(agent, client).with_tools(tools);
            if let Some(retry) = agent_config.retry {
                runtime = runtime.with_retry_config(RetryConfig {
                    max_retries: retry.max_attempts.saturating_sub(1),
                    ..Default::default()
                });
            }
            let runtime = Arc::new(runtime);

            if let Some(store) = &self.memory_store {
                match agent_config.memory.memory_type {
                    MemoryType::Shared => {
                        runtime
                            .set_memory_store(
                                Arc::clone(store),
                                format!("shared:{}", config.name),
                            )
                            .await?;
                    }
                    MemoryType::LongTerm => {
                        runtime
                            .set_memory_store(Arc::clone(store), agent_config.name.clone())
                            .await?;
                    }
                    MemoryType::Conversation => {}
                }
            }

            runtimes.insert(agent_config.name.clone(), runtime);
        }

        let mut graph = TaskGraph::new();
        for task_config in &config.tasks {
            let mut task = Task::new(
                &task_config.name,
                &task_config.description,
                &task_config.agent,
            )
            .with_dependencies(task_config.depends_on.clone())
            .with_inputs(task_config.inputs.clone());

            let agent_timeout = config
                .agents
                .iter()
                .find(|a| a.name == task_config.agent)
                .and_then(|a| a.timeout.as_deref());
            if let Some(timeout) = task_config.timeout.as_deref().or(agent_timeout) {
                task = task.with_timeout(parse_duration(timeout)?);
            }
            if let Some(retry) = task_config.retry {
                task = task.with_retry(retry.into());
            }
            graph.add_task(task)?;
        }
        if config.effective_process() == ProcessKind::Iterative {
            graph.validate_deps()?;
        } else {
            graph.validate()?;
        }

        let state_store = self
            .state_store
            .unwrap_or_else(|| Arc::new(MemoryStateStore::new()));
        let state = Arc::new(StateManager::new(state_store, &self.workspace));
        let bus = self.bus.unwrap_or_else(|| Arc::new(EventBus::new()));
        for hook_config in &config.hooks {
            bus.register(materialize_hook(hook_config)?)?;
        }

        Ok(Crew {
            config,
            graph: Arc::new(graph),
            runtimes,
            state,
            bus,
            executor: Arc::new(TaskExecutor::new()),
        })
    }
}

/// Materialise one configured hook declaration.
fn materialize_hook(config: &HookConfig) -> Result<Arc<dyn Hook>, CadreError> {
    Ok(match config {
        HookConfig::Shell {
            name,
            command,
            blocking,
            events,
        } => {
            let mut hook = ShellHook::new(name.clone(), command.clone())
                .with_filter(events.clone());
            if *blocking {
                hook = hook.blocking();
            }
            Arc::new(hook)
        }
        HookConfig::Webhook {
            name,
            url,
            blocking,
            events,
        } => {
            let mut hook = WebhookHook::new(name.clone(), url.clone())
                .with_filter(events.clone());
            if *blocking {
                hook = hook.blocking();
            }
            Arc::new(hook)
        }
        HookConfig::Log {
            name,
            level,
            events,
        } => Arc::new(
            LogHook::new(name.clone(), parse_log_level(level)?).with_filter(events.clone()),
        ),
        HookConfig::Pause {
            name,
            message,
            events,
        } => Arc::new(PauseHook::new(name.clone(), message.clone()).with_filter(events.clone())),
    })
}

/// A runnable crew.
pub struct Crew {
    config: CrewConfig,
    graph: Arc<TaskGraph>,
    runtimes: HashMap<String, Arc<AgentRuntime>>,
    state: Arc<StateManager>,
    bus: Arc<EventBus>,
    executor: Arc<TaskExecutor>,
}

impl std::fmt::Debug for Crew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Crew").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Crew {
    /// The crew's configuration.
    pub fn config(&self) -> &CrewConfig {
        &self.config
    }

    /// The event bus; register hooks here before running.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// The state manager (run queries, checkpoints).
    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    /// The task graph.
    pub fn graph(&self) -> &Arc<TaskGraph> {
        &self.graph
    }

    /// Runtime for one agent, when it exists.
    pub fn runtime(&self, agent: &str) -> Option<&Arc<AgentRuntime>> {
        self.runtimes.get(agent)
    }

    fn coordinator(&self) -> Result<Box<dyn Coordinator>, CadreError> {
        Ok(match self.config.effective_process() {
            ProcessKind::Sequential => Box::new(SequentialCoordinator::new()),
            ProcessKind::Parallel => Box::new(ParallelCoordinator::new(
                self.config.concurrency,
                self.config.error_strategy,
            )),
            ProcessKind::Hierarchical => {
                let manager = self
                    .config
                    .manager
                    .clone()
                    .ok_or_else(|| CadreError::config("hierarchical process requires a manager"))?;
                let mut coordinator = HierarchicalCoordinator::new(manager);
                if let Some(timeout) = &self.config.timeout {
                    coordinator = coordinator.with_timeout(parse_duration(timeout)?);
                }
                Box::new(coordinator)
            }
            ProcessKind::Iterative => Box::new(IterativeCoordinator::new(
                self.config.max_iterations as usize,
                self.config.error_strategy,
            )),
        })
    }

    /// Execute the crew to completion.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<RunOutcome, CadreError> {
        let run = self.state.start_run(&self.config.name, inputs.clone()).await?;
        let result = self.drive(&run.id, cancel, inputs).await;
        self.settle(run.id, result).await
    }

    async fn drive(
        &self,
        run_id: &str,
        cancel: CancellationToken,
        inputs: HashMap<String, serde_json::Value>,
    ) -> Result<HashMap<String, serde_json::Value>, CadreError> {
        self.bus
            .emit(
                &Event::new(EventType::CrewStarted)
                    .with("run_id", run_id.to_string())
                    .with("crew", self.config.name.clone())
                    .with(
                        "process",
                        serde_json::to_value(self.config.effective_process())?,
                    ),
            )
            .await?;

        // seed run inputs into every task; the iterative coordinator does its
        // own merge per iteration
        if self.config.effective_process() != ProcessKind::Iterative {
            let seed: HashMap<String, serde_json::Value> = inputs
                .iter()
                .filter(|(k, _)| propagates(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            for task in self.graph.tasks() {
                task.merge_inputs(&seed);
            }
        }

        let ctx = RunContext {
            run_id: run_id.to_string(),
            cancel,
            graph: Arc::clone(&self.graph),
            runtimes: self.runtimes.clone(),
            executor: Arc::clone(&self.executor),
            state: Arc::clone(&self.state),
            bus: Arc::clone(&self.bus),
            inputs,
        };
        self.coordinator()?.execute(&ctx).await
    }

    /// Resume a checkpointed run: task states are seeded from the checkpoint
    /// (completed tasks keep their outputs, everything else re-runs) and the
    /// remainder is driven by the sequential coordinator regardless of the
    /// declared process.
    pub async fn resume(
        &self,
        cancel: CancellationToken,
        checkpoint_id: &str,
    ) -> Result<RunOutcome, CadreError> {
        let checkpoint = self
            .state
            .load_checkpoint(checkpoint_id)
            .await?
            .ok_or_else(|| {
                CadreError::state(format!("unknown checkpoint '{}'", checkpoint_id))
            })?;

        for (name, snapshot) in &checkpoint.run.task_states {
            if let Some(task) = self.graph.get(name) {
                task.restore(snapshot);
                // completed (and deliberately skipped) tasks keep their
                // outputs; everything else re-runs from scratch
                match task.status() {
                    TaskStatus::Completed | TaskStatus::Skipped => {}
                    _ => task.reset(),
                }
            }
        }
        for (agent, messages) in &checkpoint.memories {
            if let Some(runtime) = self.runtimes.get(agent) {
                runtime.agent().memory.restore(messages.clone()).await;
            }
        }

        let run = self.state.adopt_run(checkpoint.run.clone()).await?;
        let result = async {
            self.bus
                .emit(
                    &Event::new(EventType::CrewStarted)
                        .with("run_id", run.id.clone())
                        .with("crew", self.config.name.clone())
                        .with("resumed", true),
                )
                .await?;
            let ctx = RunContext {
                run_id: run.id.clone(),
                cancel,
                graph: Arc::clone(&self.graph),
                runtimes: self.runtimes.clone(),
                executor: Arc::clone(&self.executor),
                state: Arc::clone(&self.state),
                bus: Arc::clone(&self.bus),
                inputs: run.inputs.clone(),
            };
            SequentialCoordinator::new().execute(&ctx).await
        }
        .await;
        self.settle(run.id, result).await
    }

    /// Take an explicit checkpoint of the active run.
    pub async fn checkpoint(
        &self,
        current_task: Option<String>,
    ) -> Result<String, CadreError> {
        let memories = self.memory_snapshots().await;
        let checkpoint = self.state.save_checkpoint(current_task, memories).await?;
        Ok(checkpoint.id)
    }

    async fn memory_snapshots(&self) -> HashMap<String, Vec<Message>> {
        let mut snapshots = HashMap::new();
        for (name, runtime) in &self.runtimes {
            snapshots.insert(name.clone(), runtime.agent().memory.messages().await);
        }
        snapshots
    }

    /// Record the run outcome, emit the terminal crew event, and surface the
    /// result.  Failures are checkpointed before they surface.
    async fn settle(
        &self,
        run_id: String,
        result: Result<HashMap<String, serde_json::Value>, CadreError>,
    ) -> Result<RunOutcome, CadreError> {
        match result {
            Ok(outputs) => {
                self.state.complete_run(outputs.clone()).await?;
                self.bus
                    .emit(
                        &Event::new(EventType::CrewCompleted)
                            .with("run_id", run_id.clone())
                            .with("crew", self.config.name.clone()),
                    )
                    .await?;
                Ok(RunOutcome { run_id, outputs })
            }
            Err(err) => {
                let memories = self.memory_snapshots().await;
                if let Err(checkpoint_err) = self.state.save_checkpoint(None, memories).await {
                    log::warn!(
                        "failed to checkpoint run {} before surfacing error: {}",
                        run_id,
                        checkpoint_err
                    );
                }
                let record = if err.is_cancellation() {
                    self.state.cancel_run(&err.to_string()).await
                } else {
                    self.state.fail_run(&err.to_string()).await
                };
                if let Err(record_err) = record {
                    log::error!("failed to record run {} failure: {}", run_id, record_err);
                }
                // best-effort: a failing blocking hook must not mask the error
                let _ = self
                    .bus
                    .emit(
                        &Event::new(EventType::CrewFailed)
                            .with("run_id", run_id)
                            .with("crew", self.config.name.clone())
                            .with("error", err.to_string()),
                    )
                    .await;
                Err(err)
            }
        }
    }
}
