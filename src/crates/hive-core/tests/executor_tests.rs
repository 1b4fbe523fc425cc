//! End-to-end executor scenarios: linear flows, routing, pause/resume,
//! parallel fan-out, loop bounds, cancellation, and boundary behaviors.

use hive_checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use hive_core::{
    Event, EventBus, EventFilter, ExecutionContext, ExecutionStatus, ExecutorConfig,
    FunctionRegistry, GraphExecutor, GraphSpec, ScriptedProvider, SharedState, Subscription,
    ToolDescriptor, ToolRegistry, TriggerKind,
};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    executor: GraphExecutor,
    bus: Arc<EventBus>,
    checkpoints: Arc<InMemoryCheckpointStore>,
    provider: Arc<ScriptedProvider>,
    #[allow(dead_code)]
    state: Arc<SharedState>,
}

fn harness(functions: FunctionRegistry) -> Harness {
    harness_with(functions, ToolRegistry::new(), ExecutorConfig::default())
}

fn harness_with(functions: FunctionRegistry, tools: ToolRegistry, config: ExecutorConfig) -> Harness {
    let state = Arc::new(SharedState::new());
    let bus = Arc::new(EventBus::new());
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let provider = Arc::new(ScriptedProvider::new());
    let executor = GraphExecutor::new(
        state.clone(),
        bus.clone(),
        checkpoints.clone(),
        provider.clone(),
        Arc::new(tools),
        Arc::new(functions),
    )
    .with_config(config);
    Harness {
        executor,
        bus,
        checkpoints,
        provider,
        state,
    }
}

fn drain(sub: &Subscription) -> Vec<Event> {
    std::iter::from_fn(|| sub.try_recv()).collect()
}

/// Per-execution sequence numbers must be gapless from 1.
fn assert_gapless(events: &[Event], execution_id: &str) {
    let seqs: Vec<u64> = events
        .iter()
        .filter(|e| e.execution_id == execution_id)
        .map(|e| e.seq)
        .collect();
    assert!(!seqs.is_empty(), "no events for execution {execution_id}");
    for (i, seq) in seqs.iter().enumerate() {
        assert_eq!(
            *seq,
            (i + 1) as u64,
            "sequence gap at position {i}: {seqs:?}"
        );
    }
}

fn completed_nodes(events: &[Event], node_id: &str) -> usize {
    events
        .iter()
        .filter(|e| {
            matches!(&e.payload, hive_core::EventPayload::NodeCompleted { node_id: n, .. } if n == node_id)
        })
        .count()
}

#[tokio::test]
async fn test_linear_graph_completes() {
    let mut functions = FunctionRegistry::new();
    functions.register("double", |args: Value| async move {
        let x = args["x"].as_i64().unwrap_or(0);
        Ok(json!({"x": x * 2}))
    });
    functions.register("inc", |args: Value| async move {
        let x = args["x"].as_i64().unwrap_or(0);
        Ok(json!({"x": x + 1}))
    });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "linear",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["c"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "double",
                 "input_keys": ["x"], "output_keys": ["x"]},
                {"id": "b", "name": "b", "type": "function", "function": "inc",
                 "input_keys": ["x"], "output_keys": ["x"]},
                {"id": "c", "name": "c", "type": "function",
                 "input_keys": ["x"], "output_keys": ["x"]}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b", "condition": "always"},
                {"id": "e2", "source": "b", "target": "c", "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let sub = h.bus.subscribe(EventFilter::all());
    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let mut input = Map::new();
    input.insert("x".to_string(), json!(1));

    let log = h.executor.execute(&graph, &mut ctx, input).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"x": 3}));
    assert_eq!(log.node_visits.len(), 3);
    assert!(log.node_visits.iter().all(|v| v.visit == 1));
    assert!(log.error.is_none());

    let events = drain(&sub);
    assert_gapless(&events, &ctx.execution_id);
    assert_eq!(completed_nodes(&events, "a"), 1);
    assert_eq!(completed_nodes(&events, "c"), 1);
    assert!(events
        .iter()
        .any(|e| e.event_type() == "execution_completed"));
}

#[tokio::test]
async fn test_router_takes_negative_branch() {
    let mut functions = FunctionRegistry::new();
    functions.register("route_sign", |args: Value| async move {
        let x = args["x"].as_i64().unwrap_or(0);
        let label = if x > 0 { "pos" } else { "neg" };
        Ok(json!({"label": label, "reasoning": format!("x is {x}")}))
    });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "router",
            "goal_id": "g",
            "entry_node": "r",
            "terminal_nodes": ["p", "n"],
            "nodes": [
                {"id": "r", "name": "r", "type": "router", "function": "route_sign",
                 "input_keys": ["x"], "output_keys": ["routed"]},
                {"id": "p", "name": "p", "type": "function",
                 "input_keys": ["routed"], "output_keys": ["routed"]},
                {"id": "n", "name": "n", "type": "function",
                 "input_keys": ["routed"], "output_keys": ["routed"]}
            ],
            "edges": [
                {"id": "e1", "source": "r", "target": "p", "condition": "routed == 'pos'"},
                {"id": "e2", "source": "r", "target": "n", "condition": "routed == 'neg'"}
            ]
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let mut input = Map::new();
    input.insert("x".to_string(), json!(-5));

    let log = h.executor.execute(&graph, &mut ctx, input).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert!(log.node_visits.iter().all(|v| v.node_id != "p"));
    assert!(log.node_visits.iter().any(|v| v.node_id == "n"));
    assert_eq!(log.decisions.len(), 1);
    let decision = &log.decisions[0];
    assert_eq!(decision.node_id, "r");
    assert_eq!(decision.chosen_id, "n");
    assert_eq!(decision.options.len(), 2);
    assert!(decision.reasoning.contains("-5"));
}

#[tokio::test]
async fn test_pause_then_resume_with_gapless_events() {
    let mut functions = FunctionRegistry::new();
    functions.register("prep", |args: Value| async move {
        Ok(json!({"question": format!("confirm {}?", args["x"])}))
    });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "pausing",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["b"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "prep",
                 "input_keys": ["x"], "output_keys": ["question"]},
                {"id": "ask", "name": "ask", "type": "client_input",
                 "input_keys": ["question"], "output_keys": ["answer"]},
                {"id": "b", "name": "b", "type": "function",
                 "input_keys": ["answer"], "output_keys": ["answer"]}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "ask", "condition": "always"},
                {"id": "e2", "source": "ask", "target": "b", "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let sub = h.bus.subscribe(EventFilter::all());
    let mut ctx = ExecutionContext::new("s1", TriggerKind::Chat);
    let mut input = Map::new();
    input.insert("x".to_string(), json!(7));

    let log = h.executor.execute(&graph, &mut ctx, input).await;
    assert_eq!(log.status, ExecutionStatus::Paused);
    assert_eq!(ctx.status, ExecutionStatus::Paused);

    let checkpoints = h.checkpoints.list_for(&ctx.execution_id).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    let checkpoint = h
        .checkpoints
        .latest_for(&ctx.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.resume_node, "ask");
    assert!(checkpoint.pending_client_request.is_some());

    // Resume with the client's reply.
    let mut resume_ctx =
        ExecutionContext::for_resume(&checkpoint, TriggerKind::Chat).with_stream("s1");
    let log = h
        .executor
        .resume(&graph, &mut resume_ctx, checkpoint, json!({"answer": "ok"}))
        .await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"answer": "ok"}));

    let events = drain(&sub);
    assert!(events
        .iter()
        .any(|e| e.event_type() == "client_input_requested"));
    assert!(events.iter().any(|e| e.event_type() == "checkpoint_created"));
    // The combined pause + resume stream shares one gapless series.
    assert_gapless(&events, &ctx.execution_id);
}

#[tokio::test]
async fn test_parallel_fan_out_runs_concurrently() {
    let mut functions = FunctionRegistry::new();
    functions.register("slow_b", |_| async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({"done_b": true}))
    });
    functions.register("slow_c", |_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(json!({"done_c": true}))
    });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "fanout",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["d"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "input_keys": [], "output_keys": []},
                {"id": "b", "name": "b", "type": "function", "function": "slow_b",
                 "input_keys": [], "output_keys": ["done_b"]},
                {"id": "c", "name": "c", "type": "function", "function": "slow_c",
                 "input_keys": [], "output_keys": ["done_c"]},
                {"id": "d", "name": "d", "type": "function",
                 "input_keys": ["b", "c"], "output_keys": ["b", "c"]}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b", "condition": "always", "parallel": true},
                {"id": "e2", "source": "a", "target": "c", "condition": "always", "parallel": true},
                {"id": "e3", "source": "b", "target": "d", "condition": "always"},
                {"id": "e4", "source": "c", "target": "d", "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let started = std::time::Instant::now();
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    let elapsed = started.elapsed();

    assert_eq!(log.status, ExecutionStatus::Completed);
    // Convergence receives branch outputs keyed by node id.
    assert_eq!(
        log.final_output,
        json!({"b": {"done_b": true}, "c": {"done_c": true}})
    );
    // Branches overlap: wall clock ≈ max(100, 50), not the sum.
    assert!(elapsed >= Duration::from_millis(100), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_single_parallel_edge_behaves_sequentially() {
    let mut functions = FunctionRegistry::new();
    functions.register("mark", |_| async { Ok(json!({"marked": true})) });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "single-parallel",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["b"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "input_keys": [], "output_keys": []},
                {"id": "b", "name": "b", "type": "function", "function": "mark",
                 "input_keys": [], "output_keys": ["marked"]}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b", "condition": "always", "parallel": true}
            ]
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"marked": true}));
    assert_eq!(log.node_visits.iter().filter(|v| v.node_id == "b").count(), 1);
}

#[tokio::test]
async fn test_loop_bound_enforced() {
    let mut functions = FunctionRegistry::new();
    functions.register("spin", |args: Value| async move {
        let n = args["n"].as_i64().unwrap_or(0);
        Ok(json!({"n": n + 1}))
    });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "looping",
            "goal_id": "g",
            "entry_node": "l",
            "terminal_nodes": [],
            "nodes": [
                {"id": "l", "name": "l", "type": "function", "function": "spin",
                 "input_keys": ["n"], "output_keys": ["n"], "max_node_visits": 3}
            ],
            "edges": [
                {"id": "e1", "source": "l", "target": "l", "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let sub = h.bus.subscribe(EventFilter::all());
    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let mut input = Map::new();
    input.insert("n".to_string(), json!(0));

    let log = h.executor.execute(&graph, &mut ctx, input).await;

    assert_eq!(log.status, ExecutionStatus::Failed);
    let envelope = log.error.unwrap();
    assert!(envelope.error.contains("loop budget"));
    // The budget is never exceeded in the counters: exactly three visits.
    assert_eq!(ctx.visit_counts["l"], 3);

    let events = drain(&sub);
    assert_eq!(completed_nodes(&events, "l"), 3);
    assert!(events
        .iter()
        .any(|e| e.event_type() == "node_loop_started"));
    assert!(events
        .iter()
        .any(|e| e.event_type() == "node_loop_iteration"));
    assert_gapless(&events, &ctx.execution_id);
}

#[tokio::test]
async fn test_cancellation_during_llm_call() {
    let h = harness(FunctionRegistry::new());
    h.provider
        .push_text_after("too slow", Duration::from_secs(60));

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "llm-cancel",
            "goal_id": "g",
            "entry_node": "gen",
            "terminal_nodes": ["gen"],
            "nodes": [
                {"id": "gen", "name": "gen", "type": "llm_generate",
                 "system_prompt": "Answer briefly.",
                 "input_keys": [], "output_keys": ["text"]}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let sub = h.bus.subscribe(EventFilter::all());
    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let execution_id = ctx.execution_id.clone();
    let cancel = ctx.cancel_token();

    let executor = h.executor.clone();
    let graph_clone = graph.clone();
    let handle =
        tokio::spawn(async move { executor.execute(&graph_clone, &mut ctx, Map::new()).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    let cancelled_at = std::time::Instant::now();
    cancel.cancel();
    let log = handle.await.unwrap();

    // Cooperative cancel must land well within 500ms.
    assert!(cancelled_at.elapsed() < Duration::from_millis(500));
    assert_eq!(log.status, ExecutionStatus::Cancelled);

    let events = drain(&sub);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        hive_core::EventPayload::ExecutionFailed { reason, .. } if reason == "cancelled"
    )));
    assert_gapless(&events, &execution_id);

    // A final checkpoint points back at the interrupted LLM node.
    let checkpoint = h.checkpoints.latest_for(&execution_id).await.unwrap().unwrap();
    assert_eq!(checkpoint.resume_node, "gen");
}

#[tokio::test]
async fn test_no_matching_edge_fails() {
    let mut functions = FunctionRegistry::new();
    functions.register("noop", |_| async { Ok(json!({})) });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "dead-end",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": [],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "noop",
                 "input_keys": [], "output_keys": []}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    assert!(log.error.unwrap().error.contains("no matching edge"));
}

#[tokio::test]
async fn test_undefined_condition_key_falls_through() {
    let mut functions = FunctionRegistry::new();
    functions.register("noop", |_| async { Ok(json!({})) });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "undef-cond",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["b", "c"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "noop",
                 "input_keys": [], "output_keys": []},
                {"id": "b", "name": "b", "type": "function", "input_keys": [], "output_keys": []},
                {"id": "c", "name": "c", "type": "function", "input_keys": [], "output_keys": []}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b", "priority": 1,
                 "condition": "nonexistent == 'x'"},
                {"id": "e2", "source": "a", "target": "c", "priority": 2,
                 "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;

    // The undefined key evaluates false (never throws); fallback taken.
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert!(log.node_visits.iter().any(|v| v.node_id == "c"));
    assert!(log.node_visits.iter().all(|v| v.node_id != "b"));
}

#[tokio::test]
async fn test_missing_input_fails_node() {
    let h = harness(FunctionRegistry::new());

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "missing-input",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["a"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function",
                 "input_keys": ["absent"], "output_keys": []}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    let envelope = log.error.unwrap();
    assert!(envelope.error.contains("absent"));
    assert_eq!(envelope.category.as_deref(), Some("input"));
}

#[tokio::test]
async fn test_budget_guard_stops_execution() {
    let mut functions = FunctionRegistry::new();
    functions.register("noop", |_| async { Ok(json!({})) });
    let config = ExecutorConfig {
        budget: Some(hive_core::ExecutionBudget {
            max_total_node_visits: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    };
    let h = harness_with(functions, ToolRegistry::new(), config);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "budgeted",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["c"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "noop",
                 "input_keys": [], "output_keys": []},
                {"id": "b", "name": "b", "type": "function", "function": "noop",
                 "input_keys": [], "output_keys": []},
                {"id": "c", "name": "c", "type": "function", "input_keys": [], "output_keys": []}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "b", "condition": "always"},
                {"id": "e2", "source": "b", "target": "c", "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let sub = h.bus.subscribe(EventFilter::all());
    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;

    assert_eq!(log.status, ExecutionStatus::Failed);
    assert_eq!(
        log.error.unwrap().category.as_deref(),
        Some("budget")
    );
    let events = drain(&sub);
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        hive_core::EventPayload::ExecutionFailed { reason, .. } if reason == "budget_exceeded"
    )));
}

#[tokio::test]
async fn test_sub_graph_maps_outputs_into_parent() {
    let mut functions = FunctionRegistry::new();
    functions.register("double", |args: Value| async move {
        let x = args["x"].as_i64().unwrap_or(0);
        Ok(json!({"x": x * 2}))
    });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "parent",
            "goal_id": "g",
            "entry_node": "outer",
            "terminal_nodes": ["done"],
            "nodes": [
                {"id": "outer", "name": "outer", "type": "sub_graph",
                 "input_keys": ["x"], "output_keys": ["x"],
                 "sub_graph": {
                     "id": "child",
                     "goal_id": "g",
                     "entry_node": "inner",
                     "terminal_nodes": ["inner"],
                     "nodes": [
                         {"id": "inner", "name": "inner", "type": "function",
                          "function": "double", "input_keys": ["x"], "output_keys": ["x"]}
                     ],
                     "edges": []
                 }},
                {"id": "done", "name": "done", "type": "function",
                 "input_keys": ["x"], "output_keys": ["x"]}
            ],
            "edges": [
                {"id": "e1", "source": "outer", "target": "done", "condition": "always"}
            ]
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let mut input = Map::new();
    input.insert("x".to_string(), json!(21));

    let log = h.executor.execute(&graph, &mut ctx, input).await;
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"x": 42}));
    // The parent node itself is visited once for the whole sub-graph run.
    assert_eq!(ctx.visit_counts["outer"], 1);
}

#[tokio::test]
async fn test_llm_generate_schema_correction() {
    let h = harness(FunctionRegistry::new());
    // First reply is unusable for a two-key node; the corrective re-prompt
    // gets a conforming object.
    h.provider.push_text("just some prose");
    h.provider.push_text(r#"{"summary": "short", "score": 3}"#);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "schema",
            "goal_id": "g",
            "entry_node": "gen",
            "terminal_nodes": ["gen"],
            "nodes": [
                {"id": "gen", "name": "gen", "type": "llm_generate",
                 "input_keys": [], "output_keys": ["summary", "score"]}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"summary": "short", "score": 3}));
    assert_eq!(h.provider.remaining(), 0);
    assert_eq!(log.cost_summary.llm_calls, 2);
}

#[tokio::test]
async fn test_llm_tool_use_loop() {
    let mut tools = ToolRegistry::new();
    tools.register_function(
        ToolDescriptor::new("lookup", "look a value up"),
        |args: Value| async move { Ok(json!({"value": format!("result for {}", args["q"]) })) },
    );
    let h = harness_with(FunctionRegistry::new(), tools, ExecutorConfig::default());

    h.provider.push_tool_call("lookup", json!({"q": "rust"}));
    h.provider.push_text("the answer is result for rust");

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "tooluse",
            "goal_id": "g",
            "entry_node": "agent",
            "terminal_nodes": ["agent"],
            "nodes": [
                {"id": "agent", "name": "agent", "type": "llm_tool_use",
                 "tools": ["lookup"],
                 "input_keys": [], "output_keys": ["answer"]}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let sub = h.bus.subscribe(EventFilter::all());
    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(
        log.final_output,
        json!({"answer": "the answer is result for rust"})
    );
    assert_eq!(log.cost_summary.tool_calls, 1);
    assert_eq!(log.cost_summary.llm_calls, 2);

    let events = drain(&sub);
    assert!(events.iter().any(|e| e.event_type() == "tool_call_started"));
    assert!(events.iter().any(|e| matches!(
        &e.payload,
        hive_core::EventPayload::ToolCallCompleted { is_error, .. } if !is_error
    )));
    assert_gapless(&events, &ctx.execution_id);
}

#[tokio::test]
async fn test_transient_provider_errors_are_retried() {
    let h = harness(FunctionRegistry::new());
    h.provider.push_error("503 upstream", true);
    h.provider.push_text("recovered");

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "retry",
            "goal_id": "g",
            "entry_node": "gen",
            "terminal_nodes": ["gen"],
            "nodes": [
                {"id": "gen", "name": "gen", "type": "llm_generate",
                 "input_keys": [], "output_keys": ["text"]}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"text": "recovered"}));
}

#[tokio::test]
async fn test_fatal_provider_error_fails_immediately() {
    let h = harness(FunctionRegistry::new());
    h.provider.push_error("401 unauthorized", false);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "fatal",
            "goal_id": "g",
            "entry_node": "gen",
            "terminal_nodes": ["gen"],
            "nodes": [
                {"id": "gen", "name": "gen", "type": "llm_generate",
                 "input_keys": [], "output_keys": ["text"]}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    assert!(log.error.unwrap().error.contains("401"));
    // The second scripted reply was never needed.
    assert_eq!(h.provider.remaining(), 0);
}

#[tokio::test]
async fn test_unregistered_function_is_configuration_error() {
    let h = harness(FunctionRegistry::new());

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "unregistered",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["a"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "ghost",
                 "input_keys": [], "output_keys": []}
            ],
            "edges": []
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;
    assert_eq!(log.status, ExecutionStatus::Failed);
    let envelope = log.error.unwrap();
    assert!(envelope.error.contains("ghost"));
    assert_eq!(envelope.category.as_deref(), Some("configuration"));
}

#[tokio::test]
async fn test_on_failure_edge_routes_error_envelope() {
    let mut functions = FunctionRegistry::new();
    functions.register("flaky", |_| async {
        Ok(json!({"error": "downstream said no"}))
    });
    functions.register("noop", |_| async { Ok(json!({})) });
    let h = harness(functions);

    let graph = Arc::new(
        GraphSpec::from_value(json!({
            "id": "failure-routing",
            "goal_id": "g",
            "entry_node": "a",
            "terminal_nodes": ["ok", "fallback"],
            "nodes": [
                {"id": "a", "name": "a", "type": "function", "function": "flaky",
                 "input_keys": [], "output_keys": ["result"]},
                {"id": "ok", "name": "ok", "type": "function", "input_keys": [], "output_keys": []},
                {"id": "fallback", "name": "fallback", "type": "function",
                 "input_keys": [], "output_keys": []}
            ],
            "edges": [
                {"id": "e1", "source": "a", "target": "ok", "condition": "on_success"},
                {"id": "e2", "source": "a", "target": "fallback", "condition": "on_failure"}
            ]
        }))
        .unwrap(),
    );

    let mut ctx = ExecutionContext::new("s1", TriggerKind::Manual);
    let log = h.executor.execute(&graph, &mut ctx, Map::new()).await;

    assert_eq!(log.status, ExecutionStatus::Completed);
    assert!(log.node_visits.iter().any(|v| v.node_id == "fallback"));
    assert!(log.node_visits.iter().all(|v| v.node_id != "ok"));
}
