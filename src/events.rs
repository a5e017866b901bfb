//! Event bus: fan-out of state transitions to per-task subscribers.
//!
//! Delivery is best-effort and ordered per subscriber. Each subscriber owns
//! a bounded queue; when it overflows, the oldest non-terminal `node_update`
//! is discarded (preferring one for the same node). Terminal events are
//! never dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use crate::models::{ExecutionNode, LogEntry, LogSeverity, TaskExecution};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Typed event published after each committed mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum AgentEvent {
    NodeUpdate { node: ExecutionNode },
    TaskUpdate { task: TaskExecution },
    Log(LogEntry),
    BrowserUrl { url: String },
}

impl AgentEvent {
    /// Terminal events survive every overflow policy.
    pub fn is_terminal(&self) -> bool {
        match self {
            AgentEvent::NodeUpdate { node } => node.current_status.is_terminal(),
            AgentEvent::TaskUpdate { task } => task.status.is_terminal(),
            AgentEvent::Log(entry) => entry.severity == LogSeverity::Error,
            AgentEvent::BrowserUrl { .. } => false,
        }
    }

    fn node_id(&self) -> Option<&str> {
        match self {
            AgentEvent::NodeUpdate { node } => Some(node.node_id.as_str()),
            _ => None,
        }
    }
}

struct SubscriberQueue {
    capacity: usize,
    queue: Mutex<VecDeque<AgentEvent>>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, event: AgentEvent) {
        {
            let mut queue = self.queue.lock().expect("subscriber queue poisoned");
            if queue.len() >= self.capacity && !event.is_terminal() {
                let evicted = evict_oldest_nonterminal(&mut queue, event.node_id());
                if !evicted {
                    // Nothing evictable: the backlog is entirely terminal
                    // traffic, which must not be displaced by this update.
                    trace!("dropping non-terminal event for saturated subscriber");
                    return;
                }
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
    }
}

/// Remove the oldest non-terminal node_update, preferring the same node id.
fn evict_oldest_nonterminal(queue: &mut VecDeque<AgentEvent>, node_id: Option<&str>) -> bool {
    if let Some(node_id) = node_id {
        if let Some(position) = queue
            .iter()
            .position(|event| !event.is_terminal() && event.node_id() == Some(node_id))
        {
            queue.remove(position);
            return true;
        }
    }
    if let Some(position) = queue
        .iter()
        .position(|event| !event.is_terminal() && event.node_id().is_some())
    {
        queue.remove(position);
        return true;
    }
    false
}

/// Receiving half of one subscription.
pub struct EventStream {
    inner: Arc<SubscriberQueue>,
}

impl EventStream {
    /// Await the next event in FIFO order.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.inner
            .queue
            .lock()
            .expect("subscriber queue poisoned")
            .pop_front()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

/// Per-task fan-out hub. Publishing never blocks the single writer.
#[derive(Default)]
pub struct EventBus {
    topics: DashMap<String, Vec<Arc<SubscriberQueue>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one task's events. Subscribing before the
    /// task exists is allowed; early events are simply buffered from the
    /// first publish after registration.
    pub fn subscribe(&self, task_id: &str, capacity: usize) -> EventStream {
        let queue = Arc::new(SubscriberQueue {
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.topics
            .entry(task_id.to_string())
            .or_default()
            .push(Arc::clone(&queue));
        EventStream { inner: queue }
    }

    pub fn publish(&self, task_id: &str, event: AgentEvent) {
        let Some(mut subscribers) = self.topics.get_mut(task_id) else {
            return;
        };
        subscribers.retain(|queue| !queue.closed.load(Ordering::SeqCst));
        for queue in subscribers.iter() {
            queue.push(event.clone());
        }
    }

    /// Drop every subscriber for a finished task.
    pub fn forget(&self, task_id: &str) {
        self.topics.remove(task_id);
    }
}
