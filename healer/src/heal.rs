//! The healing loop: clone, test, repair, ship, watch CI, retry.
//!
//! Every node is a method on [`Nodes`] that reads the current [`RunState`]
//! and returns a [`StateUpdate`]. Nodes never return errors: failures become
//! log lines, degraded values, or (for clone) a fatal terminal update.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{error, info, instrument, warn};

use crate::core::branch::{generate_branch_name, is_expected_branch};
use crate::core::classification::{self, Classification, kind_of, target_of};
use crate::core::extract::extract_failures;
use crate::core::graph::{GraphBuilder, Next};
use crate::core::retry::{self, RetryDecision};
use crate::core::score::score;
use crate::core::types::{
    AppliedFix, CiStatus, FinalStatus, FixAttempt, HealNode, RunState, StateUpdate, TestOutcome,
};
use crate::core::validate::{SyntaxCheck, VALID, Verdict, validate_fix};
use crate::io::ai::{ChatModel, RepairModel};
use crate::io::ci::{self, CiProvider, poll_ci};
use crate::io::config::{GitConfig, HealerConfig};
use crate::io::git::{Git, Identity};
use crate::io::guards::{BranchProtectionError, NoChangesError, VcsGuard};
use crate::io::sandbox::{FIXTURE_PATH, ProcessSandbox, SandboxRunner};
use crate::io::syntax::CommandSyntaxCheck;

/// Everything needed to start one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealRequest {
    pub run_id: String,
    pub repo_url: String,
    /// Branch to clone; the remote default when `None`.
    pub source_branch: Option<String>,
    pub team_name: String,
    pub leader_name: String,
    pub max_retries: u32,
}

impl HealRequest {
    pub fn initial_state(&self) -> RunState {
        let mut state = RunState::new(&self.run_id, &self.repo_url, self.max_retries);
        state.source_branch = self.source_branch.clone();
        state.team_name = self.team_name.clone();
        state.leader_name = self.leader_name.clone();
        state
    }
}

/// Run-independent settings derived from [`HealerConfig`].
#[derive(Debug, Clone)]
pub struct HealSettings {
    pub workspace_dir: PathBuf,
    pub git: GitConfig,
    pub ci_poll_attempts: u32,
    pub ci_poll_interval: Duration,
}

impl HealSettings {
    pub fn from_config(config: &HealerConfig) -> Self {
        Self {
            workspace_dir: config.workspace_dir.clone(),
            git: config.git.clone(),
            ci_poll_attempts: config.ci.poll_attempts,
            ci_poll_interval: Duration::from_secs(config.ci.poll_interval_secs),
        }
    }

    /// Checkout location for a run.
    pub fn checkout_dir(&self, run_id: &str) -> PathBuf {
        self.workspace_dir.join("checkouts").join(run_id)
    }

    fn identity(&self) -> Identity {
        Identity {
            name: self.git.author_name.clone(),
            email: self.git.author_email.clone(),
        }
    }
}

/// External capabilities the loop depends on.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub sandbox: &'a dyn SandboxRunner,
    pub model: &'a dyn RepairModel,
    pub ci: &'a dyn CiProvider,
    pub syntax: &'a dyn SyntaxCheck,
}

/// Production collaborators built from config.
pub struct LiveCollaborators {
    sandbox: ProcessSandbox,
    model: ChatModel,
    ci: Box<dyn CiProvider>,
    syntax: CommandSyntaxCheck,
}

impl LiveCollaborators {
    pub fn from_config(config: &HealerConfig, repo_url: &str) -> Result<Self> {
        Ok(Self {
            sandbox: ProcessSandbox::new(config.sandbox.clone()),
            model: ChatModel::from_config(&config.ai)?,
            ci: ci::provider_for(repo_url, &config.ci),
            syntax: CommandSyntaxCheck::new(&config.validation),
        })
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            sandbox: &self.sandbox,
            model: &self.model,
            ci: self.ci.as_ref(),
            syntax: &self.syntax,
        }
    }
}

/// Final state of a run and the nodes it passed through.
#[derive(Debug)]
pub struct HealOutcome {
    pub state: RunState,
    pub visited: Vec<HealNode>,
}

impl HealOutcome {
    pub fn test_runs(&self) -> usize {
        self.visited
            .iter()
            .filter(|node| **node == HealNode::RunTests)
            .count()
    }
}

/// `run_<timestamp>_<6 random chars>`.
pub fn new_run_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("run_{}_{suffix}", Utc::now().format("%Y%m%d_%H%M%S"))
}

/// Drive one run to a terminal state.
///
/// `observer` is called after every node with that node's delta and the
/// merged state. The only error is a malformed graph.
#[instrument(skip_all, fields(run_id = %request.run_id))]
pub fn run_healing<F>(
    request: &HealRequest,
    tools: Collaborators<'_>,
    settings: &HealSettings,
    observer: F,
) -> Result<HealOutcome>
where
    F: FnMut(HealNode, &StateUpdate, &RunState),
{
    let nodes = Nodes { tools, settings };
    let mut graph = GraphBuilder::new()
        .node(HealNode::Clone, |s: &RunState| nodes.clone_repository(s))
        .node(HealNode::RunTests, |s: &RunState| nodes.run_tests(s))
        .node(HealNode::ClassifyFailures, |s: &RunState| nodes.classify(s))
        .node(HealNode::GenerateFixes, |s: &RunState| nodes.generate(s))
        .node(HealNode::ValidateFixes, |s: &RunState| nodes.validate(s))
        .node(HealNode::Commit, |s: &RunState| nodes.commit(s))
        .node(HealNode::Push, |s: &RunState| nodes.push(s))
        .node(HealNode::MonitorCi, |s: &RunState| nodes.monitor_ci(s))
        .node(HealNode::RetryDecision, |s: &RunState| nodes.retry_decision(s))
        .route(HealNode::Clone, |s: &RunState| {
            if s.fatal_error.is_some() {
                Next::Terminal
            } else {
                Next::Node(HealNode::RunTests)
            }
        })
        .route(HealNode::RunTests, |s: &RunState| {
            if s.is_finished() {
                Next::Terminal
            } else {
                Next::Node(HealNode::ClassifyFailures)
            }
        })
        .edge(HealNode::ClassifyFailures, HealNode::GenerateFixes)
        .edge(HealNode::GenerateFixes, HealNode::ValidateFixes)
        .edge(HealNode::ValidateFixes, HealNode::Commit)
        .edge(HealNode::Commit, HealNode::Push)
        .edge(HealNode::Push, HealNode::MonitorCi)
        .route(HealNode::MonitorCi, |s: &RunState| {
            if s.ci_status == CiStatus::Passed {
                Next::Terminal
            } else {
                Next::Node(HealNode::RetryDecision)
            }
        })
        .route(HealNode::RetryDecision, |s: &RunState| {
            if s.is_finished() {
                Next::Terminal
            } else {
                Next::Node(HealNode::RunTests)
            }
        })
        .entry(HealNode::Clone)
        .compile()
        .context("build healing graph")?;

    info!(repo = %request.repo_url, max_retries = request.max_retries, "run started");
    let execution = graph.run(request.initial_state(), observer);
    info!(
        final_status = ?execution.state.final_status,
        iteration = execution.state.iteration,
        steps = execution.visited.len(),
        "run finished"
    );
    Ok(HealOutcome {
        state: execution.state,
        visited: execution.visited,
    })
}

/// Terminal fields for `status`, scored against the run so far.
fn terminal(state: &RunState, status: FinalStatus) -> StateUpdate {
    let end = Utc::now();
    let elapsed = (end - state.start_time).num_seconds();
    StateUpdate {
        final_status: Some(status),
        end_time: Some(end),
        score: Some(score(status, elapsed, state.commit_count)),
        ..StateUpdate::default()
    }
}

/// Resolve `relative` inside `root`, matching path components
/// case-insensitively when the exact path is missing. Paths that would
/// leave `root` are rejected.
pub fn resolve_in_repo(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    let exact: PathBuf = parts.iter().fold(root.to_path_buf(), |acc, p| acc.join(p));
    if exact.is_file() {
        return Some(exact);
    }

    let mut current = root.to_path_buf();
    for part in parts {
        let wanted = part.to_string_lossy();
        let found = fs::read_dir(&current).ok()?.flatten().find(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .eq_ignore_ascii_case(&wanted)
        })?;
        current = found.path();
    }
    current.is_file().then_some(current)
}

fn commit_message(fixes: &[&AppliedFix], iteration: u32) -> String {
    let Some(first) = fixes.first() else {
        return format!("Apply automated fixes (iteration {iteration})");
    };
    let (file, line) = target_of(&first.classification).unwrap_or((first.file.clone(), 0));
    let mut message = format!(
        "Fix {} error in {file} line {line}",
        kind_of(&first.classification)
    );
    if fixes.len() > 1 {
        message.push_str(&format!(" (+{} more)", fixes.len() - 1));
    }
    message
}

struct Nodes<'a> {
    tools: Collaborators<'a>,
    settings: &'a HealSettings,
}

impl Nodes<'_> {
    fn repo(&self, state: &RunState) -> Result<PathBuf> {
        state
            .repo_location
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("repository location is not set"))
    }

    fn guard(&self, repo: &Path) -> VcsGuard {
        let git = Git::new(repo).with_identity(Some(self.settings.identity()));
        VcsGuard::new(git, &self.settings.git)
    }

    #[instrument(skip_all)]
    fn clone_repository(&self, state: &RunState) -> StateUpdate {
        let dest = self.settings.checkout_dir(&state.run_id);
        let prepared = generate_branch_name(&state.team_name, &state.leader_name).and_then(|branch| {
            let git = Git::clone_or_open(
                &state.repo_url,
                &dest,
                state.source_branch.as_deref(),
                Duration::from_secs(self.settings.git.clone_timeout_secs),
            )?;
            VcsGuard::new(
                git.with_identity(Some(self.settings.identity())),
                &self.settings.git,
            )
            .create_branch(&branch)?;
            Ok(branch)
        });

        match prepared {
            Ok(branch) => StateUpdate {
                branch_name: Some(branch.clone()),
                repo_location: Some(dest.display().to_string()),
                logs: Some(state.logs_with([
                    format!("[clone] cloned {} into {}", state.repo_url, dest.display()),
                    format!("[clone] working branch {branch}"),
                ])),
                ..StateUpdate::default()
            },
            Err(err) => {
                let message = format!("{err:#}");
                error!(err = %message, "clone failed");
                StateUpdate {
                    fatal_error: Some(message.clone()),
                    logs: Some(state.logs_with([format!("[clone] fatal: {message}")])),
                    ..terminal(state, FinalStatus::Failed)
                }
            }
        }
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn run_tests(&self, state: &RunState) -> StateUpdate {
        let outcome = match self.repo(state) {
            Ok(repo) => self.tools.sandbox.run_tests(&repo),
            Err(err) => TestOutcome {
                error: Some(err.to_string()),
                ..Default::default()
            },
        };

        if outcome.passed {
            return StateUpdate {
                ci_status: Some(CiStatus::Passed),
                logs: Some(state.logs_with([format!(
                    "[run_tests] tests passed at iteration {}",
                    state.iteration
                )])),
                ..terminal(state, FinalStatus::Passed)
            };
        }

        let found = extract_failures(&outcome.failure_text(), state.iteration);
        let mut lines = Vec::new();
        if let Some(error) = &outcome.error {
            lines.push(format!("[run_tests] error: {error}"));
        }
        lines.push(format!(
            "[run_tests] {} failure(s) detected at iteration {}",
            found.len(),
            state.iteration
        ));
        let mut failures = state.failures.clone();
        failures.extend(found);
        StateUpdate {
            failures: Some(failures),
            ci_status: Some(CiStatus::Failed),
            logs: Some(state.logs_with(lines)),
            ..StateUpdate::default()
        }
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn classify(&self, state: &RunState) -> StateUpdate {
        let mut classified = Vec::new();
        for failure in state.current_failures() {
            let parsed = self
                .tools
                .model
                .classify(failure)
                .and_then(|raw| Classification::parse(&raw));
            let line = match parsed {
                Ok(classification) => classification.render(),
                Err(err) => {
                    warn!(err = %err, file = %failure.file, "classification fell back");
                    classification::fallback(failure)
                }
            };
            classified.push(line);
        }
        let mut lines: Vec<String> = classified
            .iter()
            .map(|line| format!("[classify] {line}"))
            .collect();
        lines.push(format!("[classify] classified {} failure(s)", classified.len()));
        StateUpdate {
            classified_failures: Some(classified),
            logs: Some(state.logs_with(lines)),
            ..StateUpdate::default()
        }
    }

    fn apply_fix(&self, repo: &Path, classification: &str) -> Result<AppliedFix> {
        let (file, _) =
            target_of(classification).ok_or_else(|| anyhow!("classification names no file"))?;
        let path = resolve_in_repo(repo, &file)
            .ok_or_else(|| anyhow!("{file} does not exist in the repository"))?;
        let original =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let body = self.tools.model.generate(&original, classification)?;
        fs::write(&path, &body).with_context(|| format!("write {}", path.display()))?;
        let relative = path.strip_prefix(repo).unwrap_or(&path);
        Ok(AppliedFix {
            file: relative.to_string_lossy().into_owned(),
            classification: classification.to_string(),
            original,
            body,
        })
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn generate(&self, state: &RunState) -> StateUpdate {
        let repo = match self.repo(state) {
            Ok(repo) => repo,
            Err(err) => {
                return StateUpdate {
                    classified_failures: Some(Vec::new()),
                    applied_fixes: Some(Vec::new()),
                    ..StateUpdate::log(state, format!("[generate] skipped: {err}"))
                };
            }
        };
        // `kept[i]` is the classification `fixes[i]` was generated from.
        let mut kept = Vec::new();
        let mut fixes = Vec::new();
        let mut lines = Vec::new();
        for classification in &state.classified_failures {
            match self.apply_fix(&repo, classification) {
                Ok(fix) => {
                    lines.push(format!("[generate] wrote fix for {}", fix.file));
                    kept.push(classification.clone());
                    fixes.push(fix);
                }
                Err(err) => {
                    warn!(err = %err, "fix not generated");
                    lines.push(format!("[generate] skipped: {err:#}"));
                }
            }
        }
        lines.push(format!("[generate] applied {} fix(es)", fixes.len()));
        StateUpdate {
            classified_failures: Some(kept),
            applied_fixes: Some(fixes),
            logs: Some(state.logs_with(lines)),
            ..StateUpdate::default()
        }
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn validate(&self, state: &RunState) -> StateUpdate {
        let repo = self.repo(state).ok();
        let mut results = Vec::new();
        let mut fix_log = state.fix_log.clone();
        let mut lines = Vec::new();
        for fix in &state.applied_fixes {
            let path = repo.as_ref().map(|repo| repo.join(&fix.file));
            let current = path.as_ref().and_then(|path| fs::read_to_string(path).ok());
            let verdict = match &current {
                Some(current) => {
                    validate_fix(&fix.original, current, &fix.classification, self.tools.syntax)
                }
                None => Verdict::Invalid("fixed file unreadable"),
            };
            if !verdict.is_valid() {
                if let Some(path) = &path {
                    if let Err(err) = fs::write(path, &fix.original) {
                        warn!(err = %err, file = %fix.file, "failed to revert invalid fix");
                    }
                }
            }
            lines.push(format!("[validate] {}: {verdict}", fix.file));
            fix_log.push(FixAttempt {
                iteration: state.iteration,
                file: fix.file.clone(),
                bug_kind: kind_of(&fix.classification).to_string(),
                line: target_of(&fix.classification).map_or(0, |(_, line)| line),
                valid: verdict.is_valid(),
                commit_message: None,
            });
            results.push(verdict.to_string());
        }
        StateUpdate {
            validation_results: Some(results),
            fix_log: Some(fix_log),
            logs: Some(state.logs_with(lines)),
            ..StateUpdate::default()
        }
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn commit(&self, state: &RunState) -> StateUpdate {
        let repo = match self.repo(state) {
            Ok(repo) => repo,
            Err(err) => return StateUpdate::log(state, format!("[commit] skipped: {err}")),
        };
        let guard = self.guard(&repo);
        match guard.git().current_branch() {
            Ok(current) if is_expected_branch(&state.team_name, &state.leader_name, &current) => {}
            Ok(current) => {
                return StateUpdate::log(
                    state,
                    format!("[commit] skipped: on branch {current}, not the working branch"),
                );
            }
            Err(err) => return StateUpdate::log(state, format!("[commit] skipped: {err:#}")),
        }

        let valid: Vec<&AppliedFix> = state
            .applied_fixes
            .iter()
            .zip(&state.validation_results)
            .filter(|(_, verdict)| verdict.as_str() == VALID)
            .map(|(fix, _)| fix)
            .collect();
        let message = commit_message(&valid, state.iteration);

        // A synthesized fixture is a local test aid and never pushed.
        let excluded: &[&str] = match guard.git().is_tracked(FIXTURE_PATH) {
            Ok(false) => &[FIXTURE_PATH],
            _ => &[],
        };

        match guard.commit_excluding(&message, excluded) {
            Ok(full) => {
                let fix_log = state
                    .fix_log
                    .iter()
                    .cloned()
                    .map(|mut attempt| {
                        if attempt.iteration == state.iteration && attempt.valid {
                            attempt.commit_message = Some(full.clone());
                        }
                        attempt
                    })
                    .collect();
                StateUpdate {
                    commit_count: Some(state.commit_count + 1),
                    fix_log: Some(fix_log),
                    logs: Some(state.logs_with([format!("[commit] {full}")])),
                    ..StateUpdate::default()
                }
            }
            Err(err) => {
                let line = if let Some(blocked) = err.downcast_ref::<BranchProtectionError>() {
                    format!("[commit] blocked: {blocked}")
                } else if err.downcast_ref::<NoChangesError>().is_some() {
                    "[commit] nothing to commit".to_string()
                } else {
                    format!("[commit] failed: {err:#}")
                };
                warn!(%line, "commit skipped");
                StateUpdate::log(state, line)
            }
        }
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn push(&self, state: &RunState) -> StateUpdate {
        let line = match self.repo(state) {
            Ok(repo) => match self.guard(&repo).push_current() {
                Ok(branch) => format!("[push] pushed {branch} to {}", self.settings.git.remote),
                Err(err) => match err.downcast_ref::<BranchProtectionError>() {
                    Some(blocked) => format!("[push] blocked: {blocked}"),
                    None => format!("[push] failed: {err:#}"),
                },
            },
            Err(err) => format!("[push] skipped: {err}"),
        };
        StateUpdate::log(state, line)
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn monitor_ci(&self, state: &RunState) -> StateUpdate {
        let report = poll_ci(
            self.tools.ci,
            self.settings.ci_poll_attempts,
            self.settings.ci_poll_interval,
        );
        if report.success {
            return StateUpdate {
                ci_status: Some(CiStatus::Passed),
                logs: Some(state.logs_with(["[monitor_ci] CI passed".to_string()])),
                ..terminal(state, FinalStatus::Fixed)
            };
        }
        StateUpdate {
            ci_status: Some(CiStatus::Failed),
            logs: Some(state.logs_with([format!(
                "[monitor_ci] CI not passing (completed={})",
                report.completed
            )])),
            ..StateUpdate::default()
        }
    }

    #[instrument(skip_all, fields(iteration = state.iteration))]
    fn retry_decision(&self, state: &RunState) -> StateUpdate {
        match retry::decide(state.iteration, state.max_retries) {
            RetryDecision::Retry { next_iteration } => StateUpdate {
                iteration: Some(next_iteration),
                logs: Some(state.logs_with([format!(
                    "[retry_decision] retrying (attempt {next_iteration}/{})",
                    state.max_retries
                )])),
                ..StateUpdate::default()
            },
            RetryDecision::Exhausted => StateUpdate {
                logs: Some(state.logs_with([format!(
                    "[retry_decision] max retries exceeded ({}/{})",
                    state.iteration, state.max_retries
                )])),
                ..terminal(state, FinalStatus::Failed)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(classification: &str, file: &str) -> AppliedFix {
        AppliedFix {
            file: file.to_string(),
            classification: classification.to_string(),
            original: String::new(),
            body: String::new(),
        }
    }

    #[test]
    fn resolve_prefers_exact_then_case_insensitive_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("Src")).expect("mkdir");
        fs::write(temp.path().join("Src/Calc.py"), "x = 1\n").expect("write");

        let found = resolve_in_repo(temp.path(), "src/calc.py").expect("resolved");
        assert!(found.ends_with("Src/Calc.py"));
        let exact = resolve_in_repo(temp.path(), "./Src/Calc.py").expect("resolved");
        assert!(exact.ends_with("Src/Calc.py"));
    }

    #[test]
    fn resolve_rejects_escapes_and_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("pkg")).expect("mkdir");
        assert!(resolve_in_repo(temp.path(), "../etc/passwd").is_none());
        assert!(resolve_in_repo(temp.path(), "/etc/passwd").is_none());
        assert!(resolve_in_repo(temp.path(), "pkg").is_none());
        assert!(resolve_in_repo(temp.path(), "unknown").is_none());
    }

    #[test]
    fn commit_message_names_first_fix_and_counts_rest() {
        let a = fix("LOGIC error in calc.py line 2 → Fix: use +", "calc.py");
        let b = fix("IMPORT error in app.py line 1 → Fix: import os", "app.py");
        assert_eq!(
            commit_message(&[&a], 0),
            "Fix LOGIC error in calc.py line 2"
        );
        assert_eq!(
            commit_message(&[&a, &b], 0),
            "Fix LOGIC error in calc.py line 2 (+1 more)"
        );
        assert_eq!(commit_message(&[], 3), "Apply automated fixes (iteration 3)");
    }

    #[test]
    fn run_ids_are_unique_and_prefixed() {
        let a = new_run_id();
        let b = new_run_id();
        assert!(a.starts_with("run_"));
        assert_ne!(a, b);
    }
}
