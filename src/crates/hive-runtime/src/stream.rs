//! Execution streams: a trigger source plus a concurrency-bounded set of
//! running executions.
//!
//! Admission goes through a fair semaphore, so executions start in
//! trigger order (they may complete out of order). Completed runs leave
//! the in-memory map immediately — their events were flushed to every
//! subscriber during the run — and a bounded ring of recent [`RunLog`]s
//! remains for inspection. `stop` cancels everything cooperatively under
//! a shutdown budget, then force-aborts stragglers.

use crate::error::{Result, RuntimeError};
use hive_core::{
    ExecutionContext, GraphExecutor, GraphSpec, RunLog, SharedState, TriggerKind,
};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Budget for cooperative shutdown before stragglers are force-cancelled.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Per-stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub id: String,
    pub trigger: TriggerKind,
    /// Simultaneous executions admitted by this stream.
    pub max_concurrency: usize,
    /// How many recent run logs the ring buffer retains.
    pub history: usize,
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, trigger: TriggerKind) -> Self {
        Self {
            id: id.into(),
            trigger,
            max_concurrency: trigger.default_concurrency(),
            history: 32,
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history.max(1);
        self
    }
}

struct RunningExecution {
    cancel: CancellationToken,
    done: watch::Receiver<Option<RunLog>>,
    handle: tokio::task::JoinHandle<()>,
}

type RunningMap = Arc<Mutex<HashMap<String, RunningExecution>>>;
type RecentRing = Arc<Mutex<VecDeque<RunLog>>>;

/// One trigger source's set of concurrent executions.
pub struct ExecutionStream {
    config: StreamConfig,
    graph: Arc<GraphSpec>,
    executor: GraphExecutor,
    state: Arc<SharedState>,
    semaphore: Arc<Semaphore>,
    running: RunningMap,
    recent: RecentRing,
    drivers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl ExecutionStream {
    pub(crate) fn new(
        config: StreamConfig,
        graph: Arc<GraphSpec>,
        executor: GraphExecutor,
        state: Arc<SharedState>,
    ) -> Self {
        let permits = config.max_concurrency;
        Self {
            config,
            graph,
            executor,
            state,
            semaphore: Arc::new(Semaphore::new(permits)),
            running: Arc::new(Mutex::new(HashMap::new())),
            recent: Arc::new(Mutex::new(VecDeque::new())),
            drivers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn trigger_kind(&self) -> TriggerKind {
        self.config.trigger
    }

    /// Begin accepting triggers. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            info!(stream = %self.config.id, trigger = %self.config.trigger.as_str(), "stream started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Enqueue a new execution.
    ///
    /// Blocks while the stream is at `max_concurrency`; returns the
    /// execution id once admitted. Admission order is trigger order.
    pub async fn trigger(&self, input: Map<String, Value>) -> Result<String> {
        if !self.is_running() {
            return Err(RuntimeError::StreamStopped(self.config.id.clone()));
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RuntimeError::StreamStopped(self.config.id.clone()))?;
        if !self.is_running() {
            return Err(RuntimeError::StreamStopped(self.config.id.clone()));
        }

        let mut ctx = ExecutionContext::new(&self.config.id, self.config.trigger)
            .with_cancel_token(self.shutdown.child_token());
        let execution_id = ctx.execution_id.clone();
        let cancel = ctx.cancel_token();
        let (done_tx, done_rx) = watch::channel(None);
        debug!(stream = %self.config.id, execution = %execution_id, "execution admitted");

        let executor = self.executor.clone();
        let graph = self.graph.clone();
        let state = self.state.clone();
        let history = self.config.history;
        let recent = self.recent.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let log = executor.execute(&graph, &mut ctx, input).await;
            if ctx.status.is_terminal() {
                state.drop_execution(&ctx.execution_id);
            }
            {
                let mut ring = recent.lock();
                if ring.len() >= history {
                    ring.pop_front();
                }
                ring.push_back(log.clone());
            }
            running.lock().remove(&ctx.execution_id);
            let _ = done_tx.send(Some(log));
            drop(permit);
        });

        self.running.lock().insert(
            execution_id.clone(),
            RunningExecution {
                cancel,
                done: done_rx,
                handle,
            },
        );
        // The task may have finished before the insert; don't leak the
        // entry in that case.
        let already_done = self
            .running
            .lock()
            .get(&execution_id)
            .map(|e| e.done.borrow().is_some())
            .unwrap_or(false);
        if already_done {
            self.running.lock().remove(&execution_id);
        }
        Ok(execution_id)
    }

    /// Cooperatively cancel one execution.
    pub fn cancel(&self, execution_id: &str) -> Result<()> {
        let running = self.running.lock();
        match running.get(execution_id) {
            Some(execution) => {
                execution.cancel.cancel();
                Ok(())
            }
            None => Err(RuntimeError::UnknownExecution(execution_id.to_string())),
        }
    }

    /// Wait for an execution to finish and return its run log.
    pub async fn wait_for(&self, execution_id: &str) -> Result<RunLog> {
        let waiter = self
            .running
            .lock()
            .get(execution_id)
            .map(|e| e.done.clone());
        if let Some(mut done) = waiter {
            loop {
                if let Some(log) = done.borrow().clone() {
                    return Ok(log);
                }
                if done.changed().await.is_err() {
                    break;
                }
            }
        }
        // Already finished (or sender dropped): consult the ring.
        self.recent
            .lock()
            .iter()
            .find(|log| log.run_id == execution_id)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownExecution(execution_id.to_string()))
    }

    /// The most recent run logs, oldest first.
    pub fn recent(&self) -> Vec<RunLog> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Drive this stream from a timer: one synthetic-tick execution per
    /// interval until the stream stops. Intended for `cron` streams.
    pub fn run_cron(self: &Arc<Self>, interval: Duration) {
        let stream = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick: u64 = 0;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tick += 1;
                let mut input = Map::new();
                input.insert("tick".to_string(), json!(tick));
                input.insert("ts".to_string(), json!(chrono::Utc::now().to_rfc3339()));
                if let Err(e) = stream.trigger(input).await {
                    debug!(stream = %stream.config.id, error = %e, "cron tick not admitted");
                    break;
                }
            }
        });
        self.drivers.lock().push(handle);
    }

    /// Stop the stream: cancel every running execution, wait out the
    /// shutdown budget, force-abort stragglers. Idempotent.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(stream = %self.config.id, "stream stopping");
        self.shutdown.cancel();
        for driver in self.drivers.lock().drain(..) {
            driver.abort();
        }

        let waiters: Vec<(String, watch::Receiver<Option<RunLog>>)> = self
            .running
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.done.clone()))
            .collect();

        let deadline = tokio::time::Instant::now() + SHUTDOWN_BUDGET;
        for (id, mut done) in waiters {
            let finished = loop {
                if done.borrow().is_some() {
                    break true;
                }
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break false;
                }
                match tokio::time::timeout(remaining, done.changed()).await {
                    Ok(Ok(())) => continue,
                    Ok(Err(_)) => break true,
                    Err(_) => break false,
                }
            };
            if !finished {
                warn!(stream = %self.config.id, execution = %id, "force-cancelling straggler");
                if let Some(execution) = self.running.lock().remove(&id) {
                    execution.handle.abort();
                }
            }
        }
        self.running.lock().clear();
    }
}
