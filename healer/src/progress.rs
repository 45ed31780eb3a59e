//! Run progress events and per-run fan-out to observers.
//!
//! The hub is synchronous to publish into: delivery uses bounded
//! `tokio::sync::mpsc` queues with `try_send`, so a node never waits on a
//! slow observer. Observers whose queue is full or closed are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::core::types::{CiStatus, FailureRecord, HealNode, RunState};

/// Default per-observer queue depth.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;
/// Log lines carried by each event.
pub const EVENT_LOG_TAIL: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PipelineUpdate,
    PipelineComplete,
    PipelineError,
}

/// Lifecycle status of a submitted run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// File and classification of an applied fix, without file bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixSummary {
    pub file: String,
    pub classification: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub run_id: String,
    pub status: RunStatus,
    pub progress: u8,
    pub current_step: String,
    pub iteration: u32,
    pub failures_detected: Vec<FailureRecord>,
    pub fixes_applied: Vec<FixSummary>,
    pub logs: Vec<String>,
    pub ci_status: CiStatus,
    pub score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn fix_summaries(state: &RunState) -> Vec<FixSummary> {
    state
        .applied_fixes
        .iter()
        .map(|fix| FixSummary {
            file: fix.file.clone(),
            classification: fix.classification.clone(),
        })
        .collect()
}

fn log_tail(logs: &[String], n: usize) -> Vec<String> {
    logs[logs.len().saturating_sub(n)..].to_vec()
}

impl ProgressEvent {
    fn from_state(kind: EventKind, status: RunStatus, state: &RunState) -> Self {
        Self {
            kind,
            run_id: state.run_id.clone(),
            status,
            progress: 0,
            current_step: String::new(),
            iteration: state.iteration,
            failures_detected: state.failures.clone(),
            fixes_applied: fix_summaries(state),
            logs: log_tail(&state.logs, EVENT_LOG_TAIL),
            ci_status: state.ci_status,
            score: state.score,
            error: None,
        }
    }

    /// Event emitted after `node` completed.
    pub fn update(node: HealNode, state: &RunState) -> Self {
        Self {
            progress: node.progress(),
            current_step: node.label().to_string(),
            ..Self::from_state(EventKind::PipelineUpdate, RunStatus::Running, state)
        }
    }

    /// Final event for a run that reached a terminal verdict.
    pub fn complete(state: &RunState) -> Self {
        let succeeded = state.final_status.is_some_and(|status| status.is_success());
        let (status, step) = if succeeded {
            (RunStatus::Completed, "Pipeline completed successfully")
        } else {
            (RunStatus::Failed, "Max retries exceeded without fix")
        };
        Self {
            progress: 100,
            current_step: step.to_string(),
            ..Self::from_state(EventKind::PipelineComplete, status, state)
        }
    }

    /// Final event for a run that aborted.
    pub fn error(state: &RunState, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            progress: 100,
            current_step: format!("Error: {message}"),
            error: Some(message),
            ..Self::from_state(EventKind::PipelineError, RunStatus::Failed, state)
        }
    }
}

/// Receiving half handed to one observer.
pub struct Subscription {
    pub id: u64,
    pub run_id: String,
    pub events: mpsc::Receiver<ProgressEvent>,
}

struct Observer {
    id: u64,
    sender: mpsc::Sender<ProgressEvent>,
}

/// Per-run observer registry.
pub struct ProgressHub {
    observers: Mutex<HashMap<String, Vec<Observer>>>,
    next_id: AtomicU64,
    queue_depth: usize,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl ProgressHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            observers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_depth: queue_depth.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Observer>>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, run_id: &str) -> Subscription {
        let (sender, events) = mpsc::channel(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock()
            .entry(run_id.to_string())
            .or_default()
            .push(Observer { id, sender });
        debug!(run_id, observer = id, "subscribed");
        Subscription {
            id,
            run_id: run_id.to_string(),
            events,
        }
    }

    pub fn unsubscribe(&self, run_id: &str, id: u64) {
        let mut observers = self.lock();
        if let Some(list) = observers.get_mut(run_id) {
            list.retain(|observer| observer.id != id);
            if list.is_empty() {
                observers.remove(run_id);
            }
        }
    }

    pub fn observer_count(&self, run_id: &str) -> usize {
        self.lock().get(run_id).map_or(0, Vec::len)
    }

    /// Deliver `event` to every observer of its run; returns how many
    /// observers received it.
    pub fn publish(&self, event: &ProgressEvent) -> usize {
        let mut observers = self.lock();
        let Some(list) = observers.get_mut(&event.run_id) else {
            return 0;
        };
        let mut delivered = 0;
        list.retain(|observer| match observer.sender.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                debug!(observer = observer.id, "observer queue full, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(observer = observer.id, "observer gone, dropping");
                false
            }
        });
        if list.is_empty() {
            observers.remove(&event.run_id);
        }
        delivered
    }
}
