//! Stream and runtime behavior: concurrency caps, trigger ordering,
//! cancellation, shutdown, pause/resume through the runtime.

use hive_core::{
    EventFilter, ExecutionStatus, FunctionRegistry, GraphSpec, ScriptedProvider, TriggerKind,
};
use hive_runtime::{AgentRuntime, StreamConfig};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Single-node graph running the registered `work` function.
fn work_graph() -> GraphSpec {
    GraphSpec::from_value(json!({
        "id": "work",
        "goal_id": "g",
        "entry_node": "work",
        "terminal_nodes": ["work"],
        "nodes": [
            {"id": "work", "name": "work", "type": "function", "function": "work",
             "input_keys": [], "output_keys": ["out"]}
        ],
        "edges": []
    }))
    .unwrap()
}

fn pausing_graph() -> GraphSpec {
    GraphSpec::from_value(json!({
        "id": "pausing",
        "goal_id": "g",
        "entry_node": "ask",
        "terminal_nodes": ["done"],
        "nodes": [
            {"id": "ask", "name": "ask", "type": "client_input",
             "input_keys": [], "output_keys": ["answer"]},
            {"id": "done", "name": "done", "type": "function",
             "input_keys": ["answer"], "output_keys": ["answer"]}
        ],
        "edges": [
            {"id": "e1", "source": "ask", "target": "done", "condition": "always"}
        ]
    }))
    .unwrap()
}

fn runtime_with(graph: GraphSpec, functions: FunctionRegistry) -> AgentRuntime {
    AgentRuntime::builder(graph)
        .with_llm(Arc::new(ScriptedProvider::new()))
        .with_functions(functions)
        .with_checkpoints(Arc::new(hive_checkpoint::InMemoryCheckpointStore::new()))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_concurrency_never_exceeds_cap() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut functions = FunctionRegistry::new();
    {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        functions.register("work", move |_: Value| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({"out": true}))
            }
        });
    }

    let runtime = runtime_with(work_graph(), functions);
    let stream = runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::EventLoop).with_max_concurrency(2))
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..6 {
        ids.push(stream.trigger(Map::new()).await.unwrap());
    }
    for id in &ids {
        let log = stream.wait_for(id).await.unwrap();
        assert_eq!(log.status, ExecutionStatus::Completed);
    }

    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {peak:?} exceeded cap");
    assert_eq!(stream.running_count(), 0);
}

#[tokio::test]
async fn test_executions_start_in_trigger_order() {
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let mut functions = FunctionRegistry::new();
    {
        let order = order.clone();
        functions.register("work", move |args: Value| {
            let order = order.clone();
            async move {
                order.lock().push(args["i"].as_i64().unwrap_or(-1));
                Ok(json!({"out": true}))
            }
        });
    }

    let graph = GraphSpec::from_value(json!({
        "id": "ordered",
        "goal_id": "g",
        "entry_node": "work",
        "terminal_nodes": ["work"],
        "nodes": [
            {"id": "work", "name": "work", "type": "function", "function": "work",
             "input_keys": ["i"], "output_keys": ["out"]}
        ],
        "edges": []
    }))
    .unwrap();

    let runtime = runtime_with(graph, functions);
    let stream = runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::Cron))
        .unwrap();
    // Cron streams default to a concurrency of one.
    assert_eq!(stream.trigger_kind(), TriggerKind::Cron);

    let mut ids = Vec::new();
    for i in 0..5 {
        let mut input = Map::new();
        input.insert("i".to_string(), json!(i));
        ids.push(stream.trigger(input).await.unwrap());
    }
    for id in &ids {
        stream.wait_for(id).await.unwrap();
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_execution_ids_are_unique() {
    let mut functions = FunctionRegistry::new();
    functions.register("work", |_| async { Ok(json!({"out": true})) });
    let runtime = runtime_with(work_graph(), functions);
    let stream = runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::Manual))
        .unwrap();

    let mut ids = std::collections::HashSet::new();
    for _ in 0..10 {
        assert!(ids.insert(stream.trigger(Map::new()).await.unwrap()));
    }
}

#[tokio::test]
async fn test_cancel_running_execution() {
    let mut functions = FunctionRegistry::new();
    functions.register("work", |_: Value| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({"out": true}))
    });

    let runtime = runtime_with(work_graph(), functions);
    let stream = runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::Manual))
        .unwrap();

    let id = stream.trigger(Map::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    stream.cancel(&id).unwrap();

    let log = stream.wait_for(&id).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_stop_cancels_everything_and_is_idempotent() {
    let mut functions = FunctionRegistry::new();
    functions.register("work", |_: Value| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(json!({"out": true}))
    });

    let runtime = runtime_with(work_graph(), functions);
    let stream = runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::EventLoop).with_max_concurrency(4))
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(stream.trigger(Map::new()).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    stream.stop().await;
    stream.stop().await; // idempotent

    assert_eq!(stream.running_count(), 0);
    for id in &ids {
        let log = stream.wait_for(id).await.unwrap();
        assert_eq!(log.status, ExecutionStatus::Cancelled);
    }
    assert!(stream.trigger(Map::new()).await.is_err());
}

#[tokio::test]
async fn test_recent_ring_is_bounded() {
    let mut functions = FunctionRegistry::new();
    functions.register("work", |_| async { Ok(json!({"out": true})) });

    let runtime = runtime_with(work_graph(), functions);
    let stream = runtime
        .add_stream(
            StreamConfig::new("s1", TriggerKind::Manual)
                .with_max_concurrency(1)
                .with_history(2),
        )
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = stream.trigger(Map::new()).await.unwrap();
        stream.wait_for(&id).await.unwrap();
        ids.push(id);
    }

    let recent = stream.recent();
    assert_eq!(recent.len(), 2);
    // Oldest run evicted.
    assert!(recent.iter().all(|log| log.run_id != ids[0]));
}

#[tokio::test]
async fn test_pause_and_resume_through_runtime() {
    let runtime = runtime_with(pausing_graph(), FunctionRegistry::new());
    let sub = runtime.subscribe(EventFilter::all());
    let stream = runtime
        .add_stream(StreamConfig::new("chat", TriggerKind::Chat))
        .unwrap();

    let id = stream.trigger(Map::new()).await.unwrap();
    let log = stream.wait_for(&id).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Paused);

    let log = runtime.resume(&id, json!({"answer": "ok"})).await.unwrap();
    assert_eq!(log.status, ExecutionStatus::Completed);
    assert_eq!(log.final_output, json!({"answer": "ok"}));

    // One combined, gapless sequence across pause and resume.
    let events: Vec<_> = std::iter::from_fn(|| sub.try_recv())
        .filter(|e| e.execution_id == id)
        .collect();
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, (i + 1) as u64);
    }
    assert!(events
        .iter()
        .any(|e| e.event_type() == "client_input_requested"));
}

#[tokio::test]
async fn test_resume_without_checkpoint_fails() {
    let runtime = runtime_with(pausing_graph(), FunctionRegistry::new());
    let err = runtime.resume("no-such-execution", json!({})).await.unwrap_err();
    assert!(matches!(err, hive_runtime::RuntimeError::NoCheckpoint(_)));
}

#[tokio::test]
async fn test_duplicate_stream_id_rejected() {
    let mut functions = FunctionRegistry::new();
    functions.register("work", |_| async { Ok(json!({"out": true})) });
    let runtime = runtime_with(work_graph(), functions);

    runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::Manual))
        .unwrap();
    assert!(runtime
        .add_stream(StreamConfig::new("s1", TriggerKind::Manual))
        .is_err());
}

#[tokio::test]
async fn test_cron_driver_ticks() {
    let runs = Arc::new(AtomicUsize::new(0));
    let mut functions = FunctionRegistry::new();
    {
        let runs = runs.clone();
        functions.register("work", move |args: Value| {
            let runs = runs.clone();
            async move {
                assert!(args["tick"].is_u64());
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"out": true}))
            }
        });
    }

    let graph = GraphSpec::from_value(json!({
        "id": "cron",
        "goal_id": "g",
        "entry_node": "work",
        "terminal_nodes": ["work"],
        "nodes": [
            {"id": "work", "name": "work", "type": "function", "function": "work",
             "input_keys": ["tick"], "output_keys": ["out"]}
        ],
        "edges": []
    }))
    .unwrap();

    let runtime = runtime_with(graph, functions);
    let stream = runtime
        .add_stream(StreamConfig::new("cron", TriggerKind::Cron))
        .unwrap();
    stream.run_cron(Duration::from_millis(10));

    tokio::time::sleep(Duration::from_millis(80)).await;
    runtime.shutdown().await;

    assert!(runs.load(Ordering::SeqCst) >= 2, "cron never fired");
}

#[tokio::test]
async fn test_shutdown_stops_all_streams() {
    let mut functions = FunctionRegistry::new();
    functions.register("work", |_| async { Ok(json!({"out": true})) });
    let runtime = runtime_with(work_graph(), functions);

    let a = runtime
        .add_stream(StreamConfig::new("a", TriggerKind::Manual))
        .unwrap();
    let b = runtime
        .add_stream(StreamConfig::new("b", TriggerKind::Webhook))
        .unwrap();
    assert!(a.is_running() && b.is_running());

    runtime.shutdown().await;
    assert!(!a.is_running() && !b.is_running());
}
