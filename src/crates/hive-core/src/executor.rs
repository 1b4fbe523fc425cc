//! The graph executor: drives a [`GraphSpec`] to a terminal state.
//!
//! One cooperative task per execution walks the graph: select the next
//! node via edge conditions (ascending priority, ties by edge id, first
//! true condition wins), enforce per-node visit caps, run parallel fan-out
//! branches to their precomputed convergence node, record decisions, emit
//! events with gapless per-execution sequence numbers, and checkpoint on
//! pause, failure, and cancellation.
//!
//! The executor never blocks the scheduler: every I/O call observes the
//! execution's cancellation token and carries a deadline, and synchronous
//! user functions are offloaded by their registry.

use crate::condition;
use crate::context::{ExecutionContext, ExecutionStatus, TriggerKind};
use crate::error::{CoreError, ErrorEnvelope, Result};
use crate::event::{Event, EventBus, EventPayload};
use crate::graph::{EdgeCondition, EdgeSpec, GraphSpec, NodeId, NodeSpec, NodeType};
use crate::llm::LlmProvider;
use crate::node::{NodeOutput, NodeStatus};
use crate::retry::RetryPolicy;
use crate::run_log::{CostSummary, Decision, DecisionOption, NodeVisit, RunLog};
use crate::state::SharedState;
use crate::tool::{FunctionRegistry, ToolRegistry};
use chrono::Utc;
use futures::future::BoxFuture;
use hive_checkpoint::{Checkpoint, CheckpointStore};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Hard per-execution resource limits, checked before the walk starts and
/// between node executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionBudget {
    pub max_llm_calls: Option<u32>,
    pub max_tool_calls: Option<u32>,
    pub max_total_node_visits: Option<u32>,
}

impl ExecutionBudget {
    fn check(&self, cost: &CostSummary, total_visits: u32) -> Result<()> {
        if let Some(max) = self.max_llm_calls {
            if cost.llm_calls >= max {
                return Err(CoreError::BudgetExceeded {
                    reason: format!("llm calls reached {max}"),
                });
            }
        }
        if let Some(max) = self.max_tool_calls {
            if cost.tool_calls >= max {
                return Err(CoreError::BudgetExceeded {
                    reason: format!("tool calls reached {max}"),
                });
            }
        }
        if let Some(max) = self.max_total_node_visits {
            if total_visits > max {
                return Err(CoreError::BudgetExceeded {
                    reason: format!("node visits reached {max}"),
                });
            }
        }
        Ok(())
    }
}

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-call LLM deadline.
    pub llm_timeout: Duration,
    /// Per-call tool deadline.
    pub tool_timeout: Duration,
    /// Tool calls allowed per `llm_tool_use` node execution.
    pub tool_call_cap: u32,
    pub retry: RetryPolicy,
    pub budget: Option<ExecutionBudget>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            llm_timeout: Duration::from_millis(120_000),
            tool_timeout: Duration::from_millis(30_000),
            tool_call_cap: 16,
            retry: RetryPolicy::default(),
            budget: None,
        }
    }
}

/// Shared per-execution walk state. One instance per execution, shared by
/// reference across parallel branch futures.
pub(crate) struct WalkCtx {
    pub graph: Arc<GraphSpec>,
    pub execution_id: String,
    pub stream_id: String,
    pub trigger: TriggerKind,
    pub cancel: CancellationToken,
    seq: AtomicU64,
    bus: Arc<EventBus>,
    pub visit_counts: Mutex<HashMap<NodeId, u32>>,
    pub decisions: Mutex<Vec<Decision>>,
    pub node_visits: Mutex<Vec<NodeVisit>>,
    pub cost: Mutex<CostSummary>,
    pub current_node: Mutex<Option<NodeId>>,
    last_checkpoint: Mutex<Option<String>>,
}

impl WalkCtx {
    fn new(graph: Arc<GraphSpec>, ctx: &ExecutionContext, bus: Arc<EventBus>) -> Self {
        Self {
            graph,
            execution_id: ctx.execution_id.clone(),
            stream_id: ctx.stream_id.clone(),
            trigger: ctx.trigger,
            cancel: ctx.cancel_token(),
            seq: AtomicU64::new(ctx.initial_seq),
            bus,
            visit_counts: Mutex::new(ctx.visit_counts.clone()),
            decisions: Mutex::new(Vec::new()),
            node_visits: Mutex::new(Vec::new()),
            cost: Mutex::new(CostSummary::default()),
            current_node: Mutex::new(None),
            last_checkpoint: Mutex::new(None),
        }
    }

    /// Emit an event with the next sequence number.
    pub fn emit(&self, payload: EventPayload) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.bus.publish(Event::new(
            self.execution_id.clone(),
            self.stream_id.clone(),
            seq,
            payload,
        ));
        seq
    }

    /// Claim a sequence number to publish out of line (checkpoint events
    /// reserve theirs before the snapshot captures the counter).
    fn reserve_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn emit_reserved(&self, seq: u64, payload: EventPayload) {
        self.bus.publish(Event::new(
            self.execution_id.clone(),
            self.stream_id.clone(),
            seq,
            payload,
        ));
    }

    fn next_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    fn total_visits(&self) -> u32 {
        self.visit_counts.lock().values().sum()
    }
}

/// How a (branch of a) walk ended.
enum WalkEnd {
    /// Reached and executed a terminal node.
    Terminal {
        outputs: Map<String, Value>,
    },
    /// A branch reached the fan-in node; carries the last node's outputs.
    Converged {
        node_id: NodeId,
        outputs: Map<String, Value>,
    },
    /// A `client_input` node suspended the execution.
    Paused {
        request: Value,
    },
}

enum Start {
    Fresh { input: Map<String, Value> },
    Resume { checkpoint: Checkpoint, reply: Value },
}

/// Walks graphs over the runtime's shared services.
///
/// The executor is cheap to clone and holds no per-execution state; all of
/// that lives in the [`ExecutionContext`] and the internal walk state.
#[derive(Clone)]
pub struct GraphExecutor {
    state: Arc<SharedState>,
    bus: Arc<EventBus>,
    checkpoints: Arc<dyn CheckpointStore>,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    functions: Arc<FunctionRegistry>,
    pub(crate) config: ExecutorConfig,
}

impl GraphExecutor {
    pub fn new(
        state: Arc<SharedState>,
        bus: Arc<EventBus>,
        checkpoints: Arc<dyn CheckpointStore>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        functions: Arc<FunctionRegistry>,
    ) -> Self {
        Self {
            state,
            bus,
            checkpoints,
            llm,
            tools,
            functions,
            config: ExecutorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn llm(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    pub(crate) fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub(crate) fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Validate a graph against the registries: every `function` reference
    /// must resolve and every `sub_graph` node must embed a graph.
    pub fn validate(&self, graph: &GraphSpec) -> Result<()> {
        for node in &graph.nodes {
            match node.node_type {
                NodeType::Function | NodeType::Router => {
                    if let Some(function) = &node.function {
                        if !self.functions.contains(function) {
                            return Err(CoreError::NodeNotRegistered {
                                node: node.id.clone(),
                                function: function.clone(),
                            });
                        }
                    }
                }
                NodeType::SubGraph => match &node.sub_graph {
                    Some(sub) => self.validate(sub)?,
                    None => {
                        return Err(CoreError::InvalidGraph(format!(
                            "sub_graph node '{}' has no embedded graph",
                            node.id
                        )))
                    }
                },
                _ => {}
            }
        }
        Ok(())
    }

    /// Run a graph from its entry node to a terminal state.
    ///
    /// Always returns a [`RunLog`]; failures are recorded in it (status,
    /// error envelope) rather than surfaced as `Err`.
    pub async fn execute(
        &self,
        graph: &Arc<GraphSpec>,
        ctx: &mut ExecutionContext,
        input: Map<String, Value>,
    ) -> RunLog {
        self.run(graph, ctx, Start::Fresh { input }).await
    }

    /// Resume a paused execution from its checkpoint, supplying the
    /// client's reply for the `client_input` node it paused on.
    pub async fn resume(
        &self,
        graph: &Arc<GraphSpec>,
        ctx: &mut ExecutionContext,
        checkpoint: Checkpoint,
        reply: Value,
    ) -> RunLog {
        self.run(graph, ctx, Start::Resume { checkpoint, reply }).await
    }

    async fn run(
        &self,
        graph: &Arc<GraphSpec>,
        ctx: &mut ExecutionContext,
        start: Start,
    ) -> RunLog {
        let wc = Arc::new(WalkCtx::new(graph.clone(), ctx, self.bus.clone()));
        let mut log = RunLog::started(&ctx.execution_id, &graph.goal_id, &graph.id);
        log.start = ctx.start_time;

        if let Err(e) = self.validate(graph) {
            return self.finalize(graph, ctx, &wc, log, Err(e)).await;
        }
        if let Some(budget) = &self.config.budget {
            let check_result = {
                let cost = wc.cost.lock();
                budget.check(&cost, wc.total_visits())
            };
            if let Err(e) = check_result {
                return self.finalize(graph, ctx, &wc, log, Err(e)).await;
            }
        }

        let (entry, skip_entry_execution) = match start {
            Start::Fresh { input } => {
                self.state.merge_execution(&wc.execution_id, &input);
                wc.emit(EventPayload::ExecutionStarted {
                    trigger: wc.trigger.as_str().to_string(),
                });
                (graph.entry_node.clone(), false)
            }
            Start::Resume { checkpoint, reply } => {
                self.state.restore(&wc.execution_id, &checkpoint.state_snapshot);
                *wc.visit_counts.lock() = checkpoint
                    .visit_counts
                    .iter()
                    .map(|(k, v)| (k.clone(), *v))
                    .collect();
                wc.seq.store(checkpoint.event_seq, Ordering::SeqCst);
                *wc.last_checkpoint.lock() = Some(checkpoint.checkpoint_id.clone());

                // The client's reply becomes the paused node's outputs.
                if let Some(node) = graph.node(&checkpoint.resume_node) {
                    let outputs = reply_outputs(node, reply);
                    self.state.merge_execution(&wc.execution_id, &outputs);
                }
                wc.emit(EventPayload::ExecutionStarted {
                    trigger: wc.trigger.as_str().to_string(),
                });
                (checkpoint.resume_node.clone(), true)
            }
        };

        ctx.status = ExecutionStatus::Running;
        let result = self
            .walk(wc.clone(), entry, None, skip_entry_execution)
            .await;
        self.finalize(graph, ctx, &wc, log, result).await
    }

    /// Walk from `start` until a terminal node, the `stop_at` fan-in node,
    /// a pause, or a failure. `skip_first` enters at edge selection of the
    /// start node (resume path: its outputs are already in state).
    fn walk(
        &self,
        wc: Arc<WalkCtx>,
        start: NodeId,
        stop_at: Option<NodeId>,
        skip_first: bool,
    ) -> BoxFuture<'_, Result<WalkEnd>> {
        Box::pin(async move {
            let graph = wc.graph.clone();
            let mut current = start;
            let mut skip_execution = skip_first;
            let mut last_status = NodeStatus::Success;
            let mut last_node = current.clone();
            let mut last_outputs: Map<String, Value> = Map::new();
            let mut router_reasoning: Option<String> = None;

            loop {
                if wc.cancel.is_cancelled() {
                    return Err(CoreError::Cancelled);
                }
                if stop_at.as_deref() == Some(current.as_str()) {
                    return Ok(WalkEnd::Converged {
                        node_id: last_node,
                        outputs: last_outputs,
                    });
                }

                let node = graph.node(&current).ok_or_else(|| {
                    CoreError::InvalidGraph(format!("node '{current}' does not exist"))
                })?;
                *wc.current_node.lock() = Some(current.clone());

                if skip_execution {
                    skip_execution = false;
                    last_node = current.clone();
                } else {
                    // Visit budget: refuse re-entry at the cap so the
                    // recorded count never exceeds max_node_visits.
                    let visit = {
                        let mut counts = wc.visit_counts.lock();
                        let count = counts.entry(current.clone()).or_insert(0);
                        if *count >= node.max_node_visits {
                            return Err(CoreError::LoopBudgetExceeded {
                                node: current.clone(),
                                visits: *count,
                            });
                        }
                        *count += 1;
                        *count
                    };
                    match visit {
                        2 => {
                            wc.emit(EventPayload::NodeLoopStarted {
                                node_id: current.clone(),
                            });
                        }
                        v if v > 2 => {
                            wc.emit(EventPayload::NodeLoopIteration {
                                node_id: current.clone(),
                                iteration: v,
                            });
                        }
                        _ => {}
                    }
                    if let Some(budget) = &self.config.budget {
                        budget.check(&wc.cost.lock(), wc.total_visits())?;
                    }

                    let entered_at = Utc::now();
                    wc.emit(EventPayload::NodeStarted {
                        node_id: current.clone(),
                        visit,
                    });

                    if node.node_type == NodeType::ClientInput {
                        let request = json!({
                            "node_id": current,
                            "prompt": node.system_prompt,
                            "expected_keys": node.output_keys,
                        });
                        wc.emit(EventPayload::ClientInputRequested {
                            node_id: current.clone(),
                            request: request.clone(),
                        });
                        wc.node_visits.lock().push(NodeVisit {
                            node_id: current.clone(),
                            visit,
                            entered_at,
                            finished_at: Some(Utc::now()),
                            status: NodeStatus::Paused.as_str().to_string(),
                        });
                        wc.emit(EventPayload::NodeCompleted {
                            node_id: current.clone(),
                            visit,
                            status: NodeStatus::Paused.as_str().to_string(),
                        });
                        self.save_checkpoint(&wc, &current, Some(request.clone()))
                            .await?;
                        return Ok(WalkEnd::Paused { request });
                    }

                    let inputs = self.gather_inputs(&wc, node)?;
                    let result = if node.node_type == NodeType::SubGraph {
                        self.run_sub_graph(&wc, node, inputs).await
                    } else {
                        self.run_node(&wc, node, inputs).await
                    };
                    let output = match result {
                        Ok(output) => output,
                        Err(e) => {
                            wc.node_visits.lock().push(NodeVisit {
                                node_id: current.clone(),
                                visit,
                                entered_at,
                                finished_at: Some(Utc::now()),
                                status: NodeStatus::Failure.as_str().to_string(),
                            });
                            wc.emit(EventPayload::NodeCompleted {
                                node_id: current.clone(),
                                visit,
                                status: NodeStatus::Failure.as_str().to_string(),
                            });
                            return Err(e);
                        }
                    };

                    let outputs = filter_outputs(node, output.outputs);
                    self.state.merge_execution(&wc.execution_id, &outputs);
                    wc.node_visits.lock().push(NodeVisit {
                        node_id: current.clone(),
                        visit,
                        entered_at,
                        finished_at: Some(Utc::now()),
                        status: output.status.as_str().to_string(),
                    });
                    wc.emit(EventPayload::NodeCompleted {
                        node_id: current.clone(),
                        visit,
                        status: output.status.as_str().to_string(),
                    });

                    last_status = output.status;
                    router_reasoning = output.reasoning;
                    last_node = current.clone();
                    last_outputs = outputs;

                    if graph.is_terminal(&current) {
                        return Ok(WalkEnd::Terminal {
                            outputs: last_outputs,
                        });
                    }

                    // Self-loop shorthand: a node with a loop condition
                    // re-enters itself while the condition holds, still
                    // under its visit cap.
                    if let Some(loop_condition) = &node.loop_condition {
                        let ns = self.state.execution_namespace(&wc.execution_id);
                        if condition::holds(loop_condition, &ns) {
                            continue;
                        }
                    }
                }

                // Parallel fan-out: run every branch to the convergence
                // node, then hand it the union of branch outputs keyed by
                // the branch's last node.
                if let Some(fan) = graph.fan_out(&current) {
                    debug!(node = %current, join = %fan.join, branches = fan.branches.len(), "entering fan-out");
                    let branch_futures = fan.branches.iter().map(|(_, target)| {
                        self.walk(wc.clone(), target.clone(), Some(fan.join.clone()), false)
                    });
                    let results = futures::future::join_all(branch_futures).await;

                    let mut merged: Map<String, Value> = Map::new();
                    for result in results {
                        match result? {
                            end @ WalkEnd::Terminal { .. } => return Ok(end),
                            end @ WalkEnd::Paused { .. } => return Ok(end),
                            WalkEnd::Converged { node_id, outputs } => {
                                merged.insert(node_id, Value::Object(outputs));
                            }
                        }
                    }
                    self.state.merge_execution(&wc.execution_id, &merged);
                    last_status = NodeStatus::Success;
                    last_node = current.clone();
                    last_outputs = merged;
                    current = fan.join.clone();
                    continue;
                }

                // Edge selection: ascending priority, ties by edge id,
                // first true condition wins; errors evaluate false.
                let ns = self.state.execution_namespace(&wc.execution_id);
                let candidates: Vec<&EdgeSpec> = graph.outgoing(&current).collect();
                let chosen = candidates
                    .iter()
                    .find(|edge| edge_holds(edge, last_status, &ns));
                let Some(edge) = chosen else {
                    return Err(CoreError::NoMatchingEdge {
                        node: current.clone(),
                    });
                };

                let conditional = candidates.len() > 1
                    || !matches!(edge.condition, EdgeCondition::Always);
                if conditional {
                    let options = candidates
                        .iter()
                        .map(|e| DecisionOption {
                            id: e.target.clone(),
                            description: String::from(e.condition.clone()),
                        })
                        .collect();
                    let reasoning = router_reasoning
                        .take()
                        .unwrap_or_else(|| String::from(edge.condition.clone()));
                    wc.decisions.lock().push(Decision::new(
                        current.clone(),
                        "edge_selection",
                        options,
                        edge.target.clone(),
                        reasoning,
                    ));
                }

                current = edge.target.clone();
            }
        })
    }

    /// Run an embedded graph in a child execution context: fresh visit
    /// counts and execution scope, inherited stream scope and cancellation.
    pub(crate) async fn run_sub_graph(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
        inputs: Map<String, Value>,
    ) -> Result<NodeOutput> {
        let Some(sub) = &node.sub_graph else {
            return Err(CoreError::InvalidGraph(format!(
                "sub_graph node '{}' has no embedded graph",
                node.id
            )));
        };
        let sub_graph = Arc::new((**sub).clone());
        let mut child_ctx = ExecutionContext::new(&wc.stream_id, wc.trigger)
            .with_cancel_token(wc.cancel.child_token());
        debug!(node = %node.id, child = %child_ctx.execution_id, "running sub-graph");

        let child_log = self
            .execute(&sub_graph, &mut child_ctx, inputs)
            .await;
        self.state.drop_execution(&child_ctx.execution_id);

        {
            let mut cost = wc.cost.lock();
            cost.llm_calls += child_log.cost_summary.llm_calls;
            cost.prompt_tokens += child_log.cost_summary.prompt_tokens;
            cost.completion_tokens += child_log.cost_summary.completion_tokens;
            cost.tool_calls += child_log.cost_summary.tool_calls;
        }

        match child_log.status {
            ExecutionStatus::Completed => {
                let outputs = match child_log.final_output {
                    Value::Object(map) => map,
                    Value::Null => Map::new(),
                    other => {
                        let mut map = Map::new();
                        if let Some(key) = node.output_keys.first() {
                            map.insert(key.clone(), other);
                        }
                        map
                    }
                };
                Ok(NodeOutput::success(outputs))
            }
            ExecutionStatus::Cancelled => Err(CoreError::Cancelled),
            status => Err(CoreError::SubGraphFailed {
                node: node.id.clone(),
                status: status.as_str().to_string(),
                reason: child_log
                    .error
                    .map(|e| e.error)
                    .unwrap_or_else(|| "sub-graph did not complete".to_string()),
            }),
        }
    }

    /// Resolve a node's declared inputs from its execution namespace.
    pub(crate) fn gather_inputs(
        &self,
        wc: &WalkCtx,
        node: &NodeSpec,
    ) -> Result<Map<String, Value>> {
        let ns = self.state.execution_namespace(&wc.execution_id);
        let mut inputs = Map::new();
        for key in &node.input_keys {
            match ns.get(key) {
                Some(value) => {
                    inputs.insert(key.clone(), value.clone());
                }
                None => {
                    return Err(CoreError::missing_input(&node.id, key));
                }
            }
        }
        Ok(inputs)
    }

    /// Snapshot the execution and persist a checkpoint. The checkpoint's
    /// event counter accounts for the `checkpoint_created` event itself so
    /// resumed runs continue the gapless series.
    async fn save_checkpoint(
        &self,
        wc: &WalkCtx,
        resume_node: &str,
        pending_client_request: Option<Value>,
    ) -> Result<String> {
        let event_seq = wc.reserve_seq();
        let snapshot = self.state.snapshot(&wc.execution_id);
        let visit_counts: BTreeMap<String, u32> = wc
            .visit_counts
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let mut checkpoint = Checkpoint::new(&wc.execution_id, resume_node)
            .with_state(snapshot)
            .with_visit_counts(visit_counts)
            .with_event_seq(wc.next_seq());
        if let Some(request) = pending_client_request {
            checkpoint = checkpoint.with_pending_client_request(request);
        }
        if let Some(parent) = wc.last_checkpoint.lock().clone() {
            checkpoint = checkpoint.with_parent(parent);
        }

        let checkpoint_id = self.checkpoints.save(checkpoint).await?;
        *wc.last_checkpoint.lock() = Some(checkpoint_id.clone());
        wc.emit_reserved(
            event_seq,
            EventPayload::CheckpointCreated {
                checkpoint_id: checkpoint_id.clone(),
                resume_node: resume_node.to_string(),
            },
        );
        Ok(checkpoint_id)
    }

    async fn finalize(
        &self,
        graph: &Arc<GraphSpec>,
        ctx: &mut ExecutionContext,
        wc: &Arc<WalkCtx>,
        mut log: RunLog,
        result: Result<WalkEnd>,
    ) -> RunLog {
        let status = match result {
            Ok(WalkEnd::Terminal { outputs }) | Ok(WalkEnd::Converged { outputs, .. }) => {
                log.final_output = Value::Object(outputs);
                wc.emit(EventPayload::ExecutionCompleted {
                    run_id: log.run_id.clone(),
                });
                ExecutionStatus::Completed
            }
            Ok(WalkEnd::Paused { request }) => {
                log.final_output = json!({ "pending_client_request": request });
                ExecutionStatus::Paused
            }
            Err(e) => {
                let status = if matches!(e, CoreError::Cancelled) {
                    ExecutionStatus::Cancelled
                } else {
                    ExecutionStatus::Failed
                };
                wc.emit(EventPayload::ExecutionFailed {
                    run_id: log.run_id.clone(),
                    reason: e.reason().to_string(),
                });
                // Finalize a checkpoint at the interrupted node so the run
                // can be inspected or resumed.
                let resume_node = wc
                    .current_node
                    .lock()
                    .clone()
                    .unwrap_or_else(|| graph.entry_node.clone());
                if let Err(save_err) = self.save_checkpoint(wc, &resume_node, None).await {
                    warn!(execution_id = %wc.execution_id, error = %save_err,
                        "failed to persist final checkpoint");
                }
                // The path that led here did not work out.
                if let Some(last) = wc.decisions.lock().last_mut() {
                    last.outcome = Some(crate::run_log::DecisionOutcome::Failure);
                }
                log.error = Some(ErrorEnvelope::from(&e));
                status
            }
        };

        log.decisions = wc.decisions.lock().clone();
        log.node_visits = wc.node_visits.lock().clone();
        log.cost_summary = *wc.cost.lock();
        log.finish(status);

        ctx.status = status;
        ctx.visit_counts = wc.visit_counts.lock().clone();
        ctx.current_node = wc.current_node.lock().clone();
        log
    }
}

/// Evaluate an edge's condition against the last node status and namespace.
fn edge_holds(edge: &EdgeSpec, last_status: NodeStatus, ns: &Map<String, Value>) -> bool {
    match &edge.condition {
        EdgeCondition::Always => true,
        EdgeCondition::OnSuccess => last_status == NodeStatus::Success,
        EdgeCondition::OnFailure => last_status == NodeStatus::Failure,
        EdgeCondition::Expr(expr) => condition::holds(expr, ns),
    }
}

/// Keep declared output keys (plus structured error envelopes); everything
/// else is discarded with a warning.
fn filter_outputs(node: &NodeSpec, outputs: Map<String, Value>) -> Map<String, Value> {
    let mut kept = Map::new();
    for (key, value) in outputs {
        if node.output_keys.iter().any(|k| k == &key) || key == "error" {
            kept.insert(key, value);
        } else {
            warn!(node = %node.id, key = %key, "discarding output not covered by output_keys");
        }
    }
    kept
}

/// Map a resume reply onto the paused node's declared outputs.
fn reply_outputs(node: &NodeSpec, reply: Value) -> Map<String, Value> {
    match reply {
        Value::Object(map) => filter_outputs(node, map),
        other => {
            let mut map = Map::new();
            if let Some(key) = node.output_keys.first() {
                map.insert(key.clone(), other);
            }
            map
        }
    }
}
