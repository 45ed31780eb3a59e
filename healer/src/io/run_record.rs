//! Persisted run records under `<workspace>/runs/<run_id>/result.json`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{CiStatus, FinalStatus, RunState};
use crate::io::config::write_atomic;

/// Outcome of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationVerdict {
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub iteration: u32,
    pub verdict: IterationVerdict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixStatus {
    Fixed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixEntry {
    pub iteration: u32,
    pub file: String,
    pub bug_kind: String,
    pub line: u32,
    pub commit_message: Option<String>,
    pub status: FixStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub repo_url: String,
    pub branch_name: Option<String>,
    pub final_status: Option<FinalStatus>,
    pub ci_status: CiStatus,
    pub fatal_error: Option<String>,
    pub iterations: u32,
    pub failures_detected: usize,
    pub fixes_applied: usize,
    pub commits: u32,
    pub score: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub time_taken_secs: i64,
    pub timeline: Vec<TimelineEntry>,
    pub fixes: Vec<FixEntry>,
}

impl RunRecord {
    pub fn from_state(state: &RunState) -> Self {
        let finished_at = state.end_time;
        let time_taken_secs = finished_at
            .map(|end| (end - state.start_time).num_seconds())
            .unwrap_or(0);
        let succeeded = state.final_status.is_some_and(FinalStatus::is_success);

        // Every iteration before the last was granted a retry, so it failed.
        let timeline = (0..=state.iteration)
            .map(|iteration| TimelineEntry {
                iteration,
                verdict: if iteration == state.iteration && succeeded {
                    IterationVerdict::Passed
                } else {
                    IterationVerdict::Failed
                },
            })
            .collect();

        let fixes = state
            .fix_log
            .iter()
            .map(|attempt| FixEntry {
                iteration: attempt.iteration,
                file: attempt.file.clone(),
                bug_kind: attempt.bug_kind.clone(),
                line: attempt.line,
                commit_message: attempt.commit_message.clone(),
                status: if attempt.valid && attempt.commit_message.is_some() {
                    FixStatus::Fixed
                } else {
                    FixStatus::Failed
                },
            })
            .collect();

        Self {
            run_id: state.run_id.clone(),
            repo_url: state.repo_url.clone(),
            branch_name: state.branch_name.clone(),
            final_status: state.final_status,
            ci_status: state.ci_status,
            fatal_error: state.fatal_error.clone(),
            iterations: state.iteration,
            failures_detected: state.failures.len(),
            fixes_applied: state.applied_fixes.len(),
            commits: state.commit_count,
            score: state.score.unwrap_or(0),
            started_at: state.start_time,
            finished_at,
            time_taken_secs,
            timeline,
            fixes,
        }
    }
}

pub fn record_path(workspace: &Path, run_id: &str) -> PathBuf {
    workspace.join("runs").join(run_id).join("result.json")
}

/// Write the record for `state`; returns the file path.
pub fn write_run_record(workspace: &Path, state: &RunState) -> Result<PathBuf> {
    let record = RunRecord::from_state(state);
    let path = record_path(workspace, &state.run_id);
    let mut json = serde_json::to_string_pretty(&record).context("serialize run record")?;
    json.push('\n');
    write_atomic(&path, &json)?;
    Ok(path)
}

pub fn read_run_record(workspace: &Path, run_id: &str) -> Result<RunRecord> {
    let path = record_path(workspace, run_id);
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::core::types::FixAttempt;

    fn finished_state() -> RunState {
        let mut state = RunState::new("run-7", "https://github.com/o/r", 3);
        state.iteration = 1;
        state.final_status = Some(FinalStatus::Fixed);
        state.end_time = Some(state.start_time + Duration::seconds(42));
        state.score = Some(110);
        state.commit_count = 1;
        state.fix_log = vec![
            FixAttempt {
                iteration: 0,
                file: "calc.py".to_string(),
                bug_kind: "LOGIC".to_string(),
                line: 2,
                valid: false,
                commit_message: None,
            },
            FixAttempt {
                iteration: 1,
                file: "calc.py".to_string(),
                bug_kind: "LOGIC".to_string(),
                line: 2,
                valid: true,
                commit_message: Some("[AI-AGENT] Fix LOGIC error in calc.py line 2".to_string()),
            },
        ];
        state
    }

    #[test]
    fn timeline_marks_only_final_successful_iteration_passed() {
        let record = RunRecord::from_state(&finished_state());
        assert_eq!(
            record.timeline,
            vec![
                TimelineEntry {
                    iteration: 0,
                    verdict: IterationVerdict::Failed
                },
                TimelineEntry {
                    iteration: 1,
                    verdict: IterationVerdict::Passed
                },
            ]
        );
        assert_eq!(record.time_taken_secs, 42);
    }

    #[test]
    fn fixes_are_fixed_only_when_valid_and_committed() {
        let record = RunRecord::from_state(&finished_state());
        let statuses: Vec<FixStatus> = record.fixes.iter().map(|fix| fix.status).collect();
        assert_eq!(statuses, vec![FixStatus::Failed, FixStatus::Fixed]);
    }

    #[test]
    fn write_then_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = finished_state();
        let path = write_run_record(temp.path(), &state).expect("write");
        assert!(path.ends_with("runs/run-7/result.json"));

        let record = read_run_record(temp.path(), "run-7").expect("read");
        assert_eq!(record, RunRecord::from_state(&state));
    }
}
