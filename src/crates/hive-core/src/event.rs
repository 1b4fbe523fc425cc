//! Typed event stream for execution observability.
//!
//! Every event carries the execution and stream ids, a per-execution
//! sequence number (gapless, monotonically increasing from 1), and an
//! ISO-8601 timestamp. The bus fans out to any number of subscribers, each
//! with a bounded buffer: a slow subscriber loses its oldest events and is
//! told so with a synthetic `subscriber_lag` event — publishers never
//! block. Lag events are the ground truth of loss and are themselves never
//! dropped.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Default per-subscriber buffer capacity.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 1024;

/// Type-specific event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ExecutionStarted {
        trigger: String,
    },
    ExecutionCompleted {
        run_id: String,
    },
    ExecutionFailed {
        run_id: String,
        reason: String,
    },
    NodeStarted {
        node_id: String,
        visit: u32,
    },
    NodeCompleted {
        node_id: String,
        visit: u32,
        status: String,
    },
    NodeLoopStarted {
        node_id: String,
    },
    NodeLoopIteration {
        node_id: String,
        iteration: u32,
    },
    LlmTextDelta {
        node_id: String,
        text: String,
    },
    ClientOutputDelta {
        node_id: String,
        text: String,
    },
    ClientInputRequested {
        node_id: String,
        request: Value,
    },
    ToolCallStarted {
        node_id: String,
        tool: String,
        call_id: String,
    },
    ToolCallCompleted {
        node_id: String,
        tool: String,
        call_id: String,
        is_error: bool,
    },
    CheckpointCreated {
        checkpoint_id: String,
        resume_node: String,
    },
    /// Synthesized by the bus when a subscriber's buffer overflows.
    SubscriberLag {
        dropped: u64,
    },
}

impl EventPayload {
    /// Wire name of this payload's type tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ExecutionStarted { .. } => "execution_started",
            Self::ExecutionCompleted { .. } => "execution_completed",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::NodeStarted { .. } => "node_started",
            Self::NodeCompleted { .. } => "node_completed",
            Self::NodeLoopStarted { .. } => "node_loop_started",
            Self::NodeLoopIteration { .. } => "node_loop_iteration",
            Self::LlmTextDelta { .. } => "llm_text_delta",
            Self::ClientOutputDelta { .. } => "client_output_delta",
            Self::ClientInputRequested { .. } => "client_input_requested",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::CheckpointCreated { .. } => "checkpoint_created",
            Self::SubscriberLag { .. } => "subscriber_lag",
        }
    }
}

/// Envelope published to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub execution_id: String,
    pub stream_id: String,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(
        execution_id: impl Into<String>,
        stream_id: impl Into<String>,
        seq: u64,
        payload: EventPayload,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            stream_id: stream_id.into(),
            seq,
            ts: Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// Per-subscriber event filter. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub execution_id: Option<String>,
    pub stream_id: Option<String>,
    pub types: Option<HashSet<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_execution(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = Some(execution_id.into());
        self
    }

    pub fn for_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn for_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(id) = &self.execution_id {
            if id != &event.execution_id {
                return false;
            }
        }
        if let Some(id) = &self.stream_id {
            if id != &event.stream_id {
                return false;
            }
        }
        if let Some(types) = &self.types {
            if !types.contains(event.event_type()) {
                return false;
            }
        }
        true
    }
}

struct SubscriberShared {
    filter: EventFilter,
    capacity: usize,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberShared {
    /// Enqueue an event, applying the drop-oldest + lag policy on overflow.
    fn push(&self, event: Event) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            // Drop the oldest real event; lag markers are never dropped.
            let dropped = queue
                .iter()
                .position(|e| !matches!(e.payload, EventPayload::SubscriberLag { .. }))
                .and_then(|i| queue.remove(i));
            if let Some(dropped) = dropped {
                let coalesced = match queue.back_mut() {
                    Some(tail) => {
                        if let EventPayload::SubscriberLag { dropped: n } = &mut tail.payload {
                            *n += 1;
                            tail.seq = dropped.seq;
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                };
                if !coalesced {
                    queue.push_back(Event::new(
                        dropped.execution_id,
                        dropped.stream_id,
                        dropped.seq,
                        EventPayload::SubscriberLag { dropped: 1 },
                    ));
                }
            }
        }
        queue.push_back(event);
        drop(queue);
        self.notify.notify_one();
    }
}

/// Handle to a bus subscription; dropping it unsubscribes.
pub struct Subscription {
    shared: Arc<SubscriberShared>,
}

impl Subscription {
    /// Pop the next event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.shared.queue.lock().pop_front()
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.shared.notify.notified().await;
        }
    }

    /// Adapt the subscription into a `futures::Stream` of events.
    pub fn into_stream(self) -> impl futures::Stream<Item = Event> {
        async_stream::stream! {
            loop {
                yield self.recv().await;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

/// Process-wide publish/subscribe for execution events.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Arc<SubscriberShared>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_with_capacity(filter, DEFAULT_SUBSCRIBER_BUFFER)
    }

    pub fn subscribe_with_capacity(&self, filter: EventFilter, capacity: usize) -> Subscription {
        let shared = Arc::new(SubscriberShared {
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().push(shared.clone());
        Subscription { shared }
    }

    /// Deliver an event to every matching subscriber. Never blocks.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        for subscriber in subscribers.iter() {
            if subscriber.filter.matches(&event) {
                subscriber.push(event.clone());
            }
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));
        subscribers.len()
    }
}
