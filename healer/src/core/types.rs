//! Shared deterministic types for the healing loop.
//!
//! `RunState` is the single value threaded through every graph node. Nodes
//! never mutate it directly; they return a `StateUpdate` which the executor
//! merges (last write wins per field).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::graph::{Merge, NodeKey};

/// Routing signal for local tests and external CI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CiStatus {
    #[default]
    Pending,
    Passed,
    Failed,
}

impl CiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CiStatus::Pending => "pending",
            CiStatus::Passed => "passed",
            CiStatus::Failed => "failed",
        }
    }
}

/// Terminal verdict of a run. Once set, the run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalStatus {
    /// Tests passed without any repair.
    Passed,
    /// A repair was shipped and CI confirmed it.
    Fixed,
    /// Retry budget exhausted or the run could not start.
    Failed,
}

impl FinalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            FinalStatus::Passed => "passed",
            FinalStatus::Fixed => "fixed",
            FinalStatus::Failed => "failed",
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, FinalStatus::Passed | FinalStatus::Fixed)
    }
}

/// One discrete test failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub file: String,
    pub line: u32,
    pub message: String,
    /// Loop iteration in which the failure was observed.
    pub iteration: u32,
}

/// A replacement file body written to disk during a repair pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFix {
    /// Path relative to the repository root.
    pub file: String,
    /// Classification string this fix was generated from.
    pub classification: String,
    /// File content before the fix was written.
    pub original: String,
    /// File content written by the fix.
    pub body: String,
}

/// History entry for one fix attempt; survives across repair passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixAttempt {
    pub iteration: u32,
    pub file: String,
    pub bug_kind: String,
    pub line: u32,
    pub valid: bool,
    /// Set once the fix is part of a commit.
    pub commit_message: Option<String>,
}

/// Structured result of one sandboxed test execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestOutcome {
    pub passed: bool,
    pub stdout: String,
    pub stderr: String,
    /// Infrastructure fault or timeout description.
    pub error: Option<String>,
}

impl TestOutcome {
    /// Text handed to the failure extractor: stderr, error, then stdout.
    pub fn failure_text(&self) -> String {
        [
            self.stderr.trim(),
            self.error.as_deref().unwrap_or("").trim(),
            self.stdout.trim(),
        ]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n")
    }
}

/// Normalized CI verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CiReport {
    pub completed: bool,
    pub success: bool,
}

/// Node identifiers of the canonical healing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealNode {
    Clone,
    RunTests,
    ClassifyFailures,
    GenerateFixes,
    ValidateFixes,
    Commit,
    Push,
    MonitorCi,
    RetryDecision,
}

impl HealNode {
    /// Human-readable step label reported to observers.
    pub fn label(self) -> &'static str {
        match self {
            HealNode::Clone => "Cloning repository to local sandbox...",
            HealNode::RunTests => "Executing sandboxed tests...",
            HealNode::ClassifyFailures => "AI diagnosing test failures...",
            HealNode::GenerateFixes => "AI generating code fixes...",
            HealNode::ValidateFixes => "Performing syntax validation...",
            HealNode::Commit => "Committing verified fixes...",
            HealNode::Push => "Pushing fix to remote...",
            HealNode::MonitorCi => "Polling CI/CD status...",
            HealNode::RetryDecision => "Deciding on next steps...",
        }
    }

    /// Progress percentage reported once the node completes.
    pub fn progress(self) -> u8 {
        match self {
            HealNode::Clone => 5,
            HealNode::RunTests => 20,
            HealNode::ClassifyFailures => 35,
            HealNode::GenerateFixes => 50,
            HealNode::ValidateFixes => 60,
            HealNode::Commit => 70,
            HealNode::Push => 80,
            HealNode::MonitorCi => 90,
            HealNode::RetryDecision => 95,
        }
    }
}

impl NodeKey for HealNode {
    const ALL: &'static [Self] = &[
        HealNode::Clone,
        HealNode::RunTests,
        HealNode::ClassifyFailures,
        HealNode::GenerateFixes,
        HealNode::ValidateFixes,
        HealNode::Commit,
        HealNode::Push,
        HealNode::MonitorCi,
        HealNode::RetryDecision,
    ];

    fn name(self) -> &'static str {
        match self {
            HealNode::Clone => "clone",
            HealNode::RunTests => "run_tests",
            HealNode::ClassifyFailures => "classify_failures",
            HealNode::GenerateFixes => "generate_fixes",
            HealNode::ValidateFixes => "validate_fixes",
            HealNode::Commit => "commit",
            HealNode::Push => "push",
            HealNode::MonitorCi => "monitor_ci",
            HealNode::RetryDecision => "retry_decision",
        }
    }
}

/// State threaded through every node of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub repo_url: String,
    pub source_branch: Option<String>,
    pub team_name: String,
    pub leader_name: String,
    /// Working branch the loop commits to.
    pub branch_name: Option<String>,
    /// Local checkout; set once by the clone node.
    pub repo_location: Option<String>,
    pub iteration: u32,
    pub max_retries: u32,
    pub failures: Vec<FailureRecord>,
    pub classified_failures: Vec<String>,
    pub applied_fixes: Vec<AppliedFix>,
    pub validation_results: Vec<String>,
    pub fix_log: Vec<FixAttempt>,
    pub commit_count: u32,
    pub ci_status: CiStatus,
    pub final_status: Option<FinalStatus>,
    pub fatal_error: Option<String>,
    pub logs: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub score: Option<i64>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, repo_url: impl Into<String>, max_retries: u32) -> Self {
        let run_id = run_id.into();
        let repo_url = repo_url.into();
        let first_log = format!("Pipeline started for {repo_url}");
        Self {
            run_id,
            repo_url,
            source_branch: None,
            team_name: "default_team".to_string(),
            leader_name: "admin".to_string(),
            branch_name: None,
            repo_location: None,
            iteration: 0,
            max_retries,
            failures: Vec::new(),
            classified_failures: Vec::new(),
            applied_fixes: Vec::new(),
            validation_results: Vec::new(),
            fix_log: Vec::new(),
            commit_count: 0,
            ci_status: CiStatus::Pending,
            final_status: None,
            fatal_error: None,
            logs: vec![first_log],
            start_time: Utc::now(),
            end_time: None,
            score: None,
        }
    }

    /// Full replacement value for `logs` with `lines` appended.
    pub fn logs_with<I, S>(&self, lines: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut logs = self.logs.clone();
        logs.extend(lines.into_iter().map(Into::into));
        logs
    }

    /// Failures recorded during the current iteration.
    pub fn current_failures(&self) -> impl Iterator<Item = &FailureRecord> {
        let iteration = self.iteration;
        self.failures
            .iter()
            .filter(move |failure| failure.iteration == iteration)
    }

    pub fn is_finished(&self) -> bool {
        self.final_status.is_some()
    }
}

/// Partial update returned by a node. `None` leaves the field untouched.
///
/// List-valued fields are full replacements; nodes resend the whole list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failures: Option<Vec<FailureRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classified_failures: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_fixes: Option<Vec<AppliedFix>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_results: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_log: Option<Vec<FixAttempt>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_status: Option<CiStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_status: Option<FinalStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
}

impl StateUpdate {
    /// Update carrying only log lines appended to the current state logs.
    pub fn log<S: Into<String>>(state: &RunState, line: S) -> Self {
        Self {
            logs: Some(state.logs_with([line])),
            ..Self::default()
        }
    }
}

impl Merge for RunState {
    type Delta = StateUpdate;

    fn merge(&mut self, delta: &StateUpdate) {
        if let Some(value) = &delta.branch_name {
            self.branch_name = Some(value.clone());
        }
        if let Some(value) = &delta.repo_location {
            self.repo_location = Some(value.clone());
        }
        if let Some(value) = delta.iteration {
            self.iteration = value;
        }
        if let Some(value) = &delta.failures {
            self.failures = value.clone();
        }
        if let Some(value) = &delta.classified_failures {
            self.classified_failures = value.clone();
        }
        if let Some(value) = &delta.applied_fixes {
            self.applied_fixes = value.clone();
        }
        if let Some(value) = &delta.validation_results {
            self.validation_results = value.clone();
        }
        if let Some(value) = &delta.fix_log {
            self.fix_log = value.clone();
        }
        if let Some(value) = delta.commit_count {
            self.commit_count = value;
        }
        if let Some(value) = delta.ci_status {
            self.ci_status = value;
        }
        // A terminal verdict is written once; later writes are ignored.
        if self.final_status.is_none() {
            if let Some(value) = delta.final_status {
                self.final_status = Some(value);
                self.end_time = delta.end_time.or(self.end_time);
                self.score = delta.score.or(self.score);
            }
        }
        if let Some(value) = &delta.fatal_error {
            self.fatal_error = Some(value.clone());
        }
        if let Some(value) = &delta.logs {
            self.logs = value.clone();
        }
    }
}
