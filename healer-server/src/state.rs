//! Shared application state for the server.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use healer::core::types::RunState;
use healer::heal::HealRequest;
use healer::io::config::HealerConfig;
use healer::progress::{EventKind, ProgressEvent, ProgressHub, RunStatus};
use tracing::debug;

/// Finished runs kept in memory; the oldest are evicted beyond this.
pub const MAX_FINISHED_RUNS: usize = 200;

/// Registry entry for one submitted run.
#[derive(Debug, Clone)]
pub struct RunEntry {
    pub status: RunStatus,
    pub progress: u8,
    pub current_step: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Latest merged state; written only by the run's worker.
    pub state: RunState,
}

impl RunEntry {
    fn pending(request: &HealRequest) -> Self {
        Self {
            status: RunStatus::Pending,
            progress: 0,
            current_step: "Queued".to_string(),
            error: None,
            created_at: Utc::now(),
            state: request.initial_state(),
        }
    }

    /// Fold a progress event and the state it was built from into the entry.
    pub fn apply(&mut self, event: &ProgressEvent, state: &RunState) {
        self.status = event.status;
        self.progress = event.progress;
        self.current_step = event.current_step.clone();
        if event.error.is_some() {
            self.error = event.error.clone();
        }
        self.state = state.clone();
        if event.kind != EventKind::PipelineUpdate {
            // Views only need file and classification once a run is over.
            for fix in &mut self.state.applied_fixes {
                fix.original = String::new();
                fix.body = String::new();
            }
        }
    }

    fn is_finished(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Shared state accessible from all request handlers and run workers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HealerConfig>,
    runs: Arc<RwLock<HashMap<String, RunEntry>>>,
    pub hub: Arc<ProgressHub>,
}

impl AppState {
    pub fn new(config: HealerConfig) -> Self {
        Self {
            config: Arc::new(config),
            runs: Arc::new(RwLock::new(HashMap::new())),
            hub: Arc::new(ProgressHub::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RunEntry>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RunEntry>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, request: &HealRequest) -> RunEntry {
        let entry = RunEntry::pending(request);
        let mut runs = self.write();
        runs.insert(request.run_id.clone(), entry.clone());
        evict_finished(&mut runs, MAX_FINISHED_RUNS);
        entry
    }

    pub fn update<F>(&self, run_id: &str, f: F)
    where
        F: FnOnce(&mut RunEntry),
    {
        if let Some(entry) = self.write().get_mut(run_id) {
            f(entry);
        }
    }

    pub fn get(&self, run_id: &str) -> Option<RunEntry> {
        self.read().get(run_id).cloned()
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<RunEntry> {
        let mut entries: Vec<RunEntry> = self.read().values().cloned().collect();
        entries.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.state.run_id.cmp(&a.state.run_id))
        });
        entries.truncate(limit);
        entries
    }
}

/// Drop the oldest finished runs until at most `keep` remain. Active runs are
/// never evicted.
fn evict_finished(runs: &mut HashMap<String, RunEntry>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, String)> = runs
        .iter()
        .filter(|(_, entry)| entry.is_finished())
        .map(|(id, entry)| (entry.created_at, id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
        debug!(run_id = %run_id, "evicted finished run");
    }
}
