//! The agent runtime: composition root for one graph's execution world.

use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::stream::{ExecutionStream, StreamConfig};
use hive_checkpoint::{CheckpointStore, FsCheckpointStore};
use hive_core::{
    EventBus, EventFilter, ExecutionContext, ExecutorConfig, FunctionRegistry, Goal,
    GraphExecutor, GraphSpec, LlmProvider, RunLog, SharedState, Subscription, ToolRegistry,
    TriggerKind,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Builder for [`AgentRuntime`].
///
/// Registries are constructed explicitly and handed over here; nothing is
/// looked up from process-global state.
pub struct AgentRuntimeBuilder {
    graph: Arc<GraphSpec>,
    goal: Option<Goal>,
    config: RuntimeConfig,
    llm: Option<Arc<dyn LlmProvider>>,
    tools: ToolRegistry,
    functions: FunctionRegistry,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    executor_config: Option<ExecutorConfig>,
}

impl AgentRuntimeBuilder {
    pub fn new(graph: GraphSpec) -> Self {
        Self {
            graph: Arc::new(graph),
            goal: None,
            config: RuntimeConfig::default(),
            llm: None,
            tools: ToolRegistry::new(),
            functions: FunctionRegistry::new(),
            checkpoints: None,
            executor_config: None,
        }
    }

    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goal = Some(goal);
        self
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = Some(config);
        self
    }

    pub fn build(self) -> Result<AgentRuntime> {
        self.config.validate(false)?;
        let llm = self
            .llm
            .ok_or_else(|| RuntimeError::Configuration("no LLM provider configured".into()))?;
        let checkpoints = self
            .checkpoints
            .unwrap_or_else(|| Arc::new(FsCheckpointStore::new(&self.config.checkpoint_root)));

        let state = Arc::new(SharedState::new());
        let bus = Arc::new(EventBus::new());
        let executor_config = self.executor_config.unwrap_or_else(|| ExecutorConfig {
            llm_timeout: self.config.llm_timeout,
            tool_timeout: self.config.tool_timeout,
            ..ExecutorConfig::default()
        });
        let executor = GraphExecutor::new(
            state.clone(),
            bus.clone(),
            checkpoints.clone(),
            llm,
            Arc::new(self.tools),
            Arc::new(self.functions),
        )
        .with_config(executor_config);

        // Surface bad function references and malformed sub-graphs now,
        // not on the first trigger.
        executor.validate(&self.graph)?;

        info!(graph = %self.graph.id, "agent runtime built");
        Ok(AgentRuntime {
            graph: self.graph,
            goal: self.goal,
            config: self.config,
            state,
            bus,
            checkpoints,
            executor,
            streams: Mutex::new(HashMap::new()),
        })
    }
}

/// Owns the graph, shared state, checkpoint store, event bus, and the
/// streams that feed executions into the executor.
pub struct AgentRuntime {
    graph: Arc<GraphSpec>,
    goal: Option<Goal>,
    config: RuntimeConfig,
    state: Arc<SharedState>,
    bus: Arc<EventBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    executor: GraphExecutor,
    streams: Mutex<HashMap<String, Arc<ExecutionStream>>>,
}

impl AgentRuntime {
    pub fn builder(graph: GraphSpec) -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new(graph)
    }

    pub fn graph(&self) -> &Arc<GraphSpec> {
        &self.graph
    }

    pub fn goal(&self) -> Option<&Goal> {
        self.goal.as_ref()
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Subscribe to the runtime's event stream.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// Create (and start) a stream. Its concurrency is capped by
    /// `HIVE_MAX_STREAM_CONCURRENCY`.
    pub fn add_stream(&self, mut config: StreamConfig) -> Result<Arc<ExecutionStream>> {
        config.max_concurrency = config
            .max_concurrency
            .min(self.config.max_stream_concurrency)
            .max(1);

        let mut streams = self.streams.lock();
        if streams.contains_key(&config.id) {
            return Err(RuntimeError::Configuration(format!(
                "stream '{}' already exists",
                config.id
            )));
        }
        let stream = Arc::new(ExecutionStream::new(
            config.clone(),
            self.graph.clone(),
            self.executor.clone(),
            self.state.clone(),
        ));
        stream.start();
        streams.insert(config.id, stream.clone());
        Ok(stream)
    }

    pub fn stream(&self, id: &str) -> Option<Arc<ExecutionStream>> {
        self.streams.lock().get(id).cloned()
    }

    /// Trigger an execution on a named stream.
    pub async fn trigger(&self, stream_id: &str, input: Map<String, Value>) -> Result<String> {
        let stream = self
            .stream(stream_id)
            .ok_or_else(|| RuntimeError::UnknownStream(stream_id.to_string()))?;
        stream.trigger(input).await
    }

    /// Resume a paused execution from its latest checkpoint, supplying
    /// the client's reply.
    pub async fn resume(&self, execution_id: &str, reply: Value) -> Result<RunLog> {
        let checkpoint = self
            .checkpoints
            .latest_for(execution_id)
            .await?
            .ok_or_else(|| RuntimeError::NoCheckpoint(execution_id.to_string()))?;

        let mut ctx = ExecutionContext::for_resume(&checkpoint, TriggerKind::Manual);
        let log = self
            .executor
            .resume(&self.graph, &mut ctx, checkpoint, reply)
            .await;
        if ctx.status.is_terminal() {
            self.state.drop_execution(execution_id);
        }
        Ok(log)
    }

    /// Stop every stream concurrently under the shutdown budget.
    pub async fn shutdown(&self) {
        let streams: Vec<Arc<ExecutionStream>> = self.streams.lock().values().cloned().collect();
        futures::future::join_all(streams.iter().map(|s| s.stop())).await;
        info!(graph = %self.graph.id, "agent runtime stopped");
    }
}
