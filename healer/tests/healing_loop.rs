//! End-to-end runs of the healing loop against throwaway git repositories.
//!
//! The sandbox, model and CI are scripted except in the local-sandbox tests,
//! which run a real shell command inside the checkout.

use std::fs;
use std::path::Path;
use std::time::Duration;

use healer::core::types::{CiStatus, FinalStatus, HealNode, RunState};
use healer::core::validate::StructuralCheck;
use healer::heal::{Collaborators, HealOutcome, HealRequest, HealSettings, run_healing};
use healer::io::config::{GitConfig, SandboxBackend, SandboxConfig};
use healer::io::git::Git;
use healer::io::sandbox::{FIXTURE_PATH, ProcessSandbox, SandboxRunner};
use healer::test_support::{
    ScriptedCi, ScriptedModel, ScriptedSandbox, TestRepo, failing_outcome, passing_outcome,
};

const BUGGY: &str = "def add(a, b):\n    return a - b\n";
const FIXED: &str = "def add(a, b):\n    return a + b\n";
const CLASSIFICATION: &str = "LOGIC error in calc.py line 2 → Fix: use addition";
const FAILURE: &str = "calc.py:2: AssertionError: assert add(2, 3) == 5";
const BRANCH: &str = "DEFAULT_TEAM_ADMIN_AI_FIX";

fn origin() -> TestRepo {
    let repo = TestRepo::new("main");
    repo.write("calc.py", BUGGY);
    repo.commit_all("init");
    repo
}

fn request(repo_url: &str, max_retries: u32) -> HealRequest {
    HealRequest {
        run_id: "run_test".to_string(),
        repo_url: repo_url.to_string(),
        source_branch: None,
        team_name: "default_team".to_string(),
        leader_name: "admin".to_string(),
        max_retries,
    }
}

fn settings(workspace: &Path) -> HealSettings {
    HealSettings {
        workspace_dir: workspace.to_path_buf(),
        git: GitConfig::default(),
        ci_poll_attempts: 1,
        ci_poll_interval: Duration::ZERO,
    }
}

fn heal(
    request: &HealRequest,
    workspace: &Path,
    sandbox: &dyn SandboxRunner,
    model: &ScriptedModel,
    ci: &ScriptedCi,
) -> (HealOutcome, Vec<HealNode>) {
    let tools = Collaborators {
        sandbox,
        model,
        ci,
        syntax: &StructuralCheck,
    };
    let mut observed = Vec::new();
    let outcome = run_healing(request, tools, &settings(workspace), |node, _, _: &RunState| {
        observed.push(node);
    })
    .expect("graph compiles");
    (outcome, observed)
}

fn checkout(workspace: &Path) -> std::path::PathBuf {
    workspace.join("checkouts").join("run_test")
}

#[test]
fn passing_suite_ends_after_first_test_run() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ScriptedSandbox::new(vec![passing_outcome()]);
    let model = ScriptedModel::offline();
    let ci = ScriptedCi::failing();

    let (outcome, _) = heal(&request(&origin.url(), 3), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert_eq!(state.final_status, Some(FinalStatus::Passed));
    assert_eq!(state.ci_status, CiStatus::Passed);
    assert_eq!(state.iteration, 0);
    assert_eq!(state.score, Some(110));
    assert_eq!(state.branch_name.as_deref(), Some(BRANCH));
    assert!(state.end_time.is_some());
    assert_eq!(outcome.visited, vec![HealNode::Clone, HealNode::RunTests]);
    assert_eq!(ci.calls(), 0);
}

#[test]
fn valid_fix_is_committed_pushed_and_ends_fixed_on_green_ci() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ScriptedSandbox::new(vec![failing_outcome(FAILURE)]);
    let model = ScriptedModel::new(Some(CLASSIFICATION), Some(FIXED));
    let ci = ScriptedCi::passing();

    let (outcome, observed) =
        heal(&request(&origin.url(), 3), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert_eq!(state.final_status, Some(FinalStatus::Fixed));
    assert_eq!(state.ci_status, CiStatus::Passed);
    assert_eq!(state.commit_count, 1);
    assert_eq!(state.failures.len(), 1);
    assert_eq!(state.failures[0].file, "calc.py");
    assert_eq!(state.failures[0].line, 2);
    assert_eq!(state.iteration, 0);
    assert_eq!(state.classified_failures, vec![CLASSIFICATION.to_string()]);
    assert_eq!(state.applied_fixes.len(), 1);
    assert_eq!(state.applied_fixes[0].file, "calc.py");
    assert_eq!(state.applied_fixes[0].classification, CLASSIFICATION);
    assert_eq!(state.validation_results, vec!["VALID".to_string()]);
    assert_eq!(
        state.fix_log[0].commit_message.as_deref(),
        Some("[AI-AGENT] Fix LOGIC error in calc.py line 2")
    );
    assert_eq!(
        observed,
        vec![
            HealNode::Clone,
            HealNode::RunTests,
            HealNode::ClassifyFailures,
            HealNode::GenerateFixes,
            HealNode::ValidateFixes,
            HealNode::Commit,
            HealNode::Push,
            HealNode::MonitorCi,
        ]
    );
    assert_eq!(observed, outcome.visited);

    let fixed = fs::read_to_string(checkout(workspace.path()).join("calc.py")).expect("read");
    assert_eq!(fixed, FIXED);
    assert!(origin.git().branch_exists(BRANCH).expect("branch lookup"));
    assert_eq!(origin.read("calc.py"), BUGGY);
}

#[test]
fn retries_until_budget_is_spent() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ScriptedSandbox::new(vec![failing_outcome(FAILURE)]);
    let model = ScriptedModel::offline();
    let ci = ScriptedCi::failing();

    let (outcome, _) = heal(&request(&origin.url(), 2), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert_eq!(state.final_status, Some(FinalStatus::Failed));
    assert_eq!(state.iteration, 2);
    assert_eq!(state.score, Some(0));
    assert_eq!(sandbox.calls(), 3);
    assert_eq!(outcome.test_runs(), 3);
    assert_eq!(state.commit_count, 0);
    assert!(
        state
            .logs
            .iter()
            .any(|line| line.starts_with("[classify] UNKNOWN error in calc.py line 2"))
    );
    // The offline model produced no fix, so nothing was kept for this pass.
    assert!(state.applied_fixes.is_empty());
    assert!(state.classified_failures.is_empty());
    assert!(
        state
            .logs
            .iter()
            .any(|line| line == "[retry_decision] max retries exceeded (2/2)")
    );
    assert_eq!(
        state.failures.iter().map(|f| f.iteration).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
}

#[test]
fn unchanged_fix_is_rejected_and_not_committed() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ScriptedSandbox::new(vec![failing_outcome(FAILURE)]);
    let model = ScriptedModel::new(Some(CLASSIFICATION), Some(BUGGY));
    let ci = ScriptedCi::failing();

    let (outcome, _) = heal(&request(&origin.url(), 0), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert_eq!(state.final_status, Some(FinalStatus::Failed));
    assert_eq!(
        state.validation_results,
        vec!["INVALID: no changes made".to_string()]
    );
    assert_eq!(state.commit_count, 0);
    assert!(state.logs.iter().any(|line| line == "[commit] nothing to commit"));
    assert!(!state.fix_log[0].valid);
}

#[test]
fn missing_repository_is_fatal_after_clone() {
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ScriptedSandbox::new(vec![passing_outcome()]);
    let model = ScriptedModel::offline();
    let ci = ScriptedCi::passing();

    let (outcome, _) = heal(
        &request("/nonexistent/healer/repo", 3),
        workspace.path(),
        &sandbox,
        &model,
        &ci,
    );

    let state = &outcome.state;
    assert_eq!(state.final_status, Some(FinalStatus::Failed));
    assert_eq!(state.score, Some(0));
    assert!(
        state
            .fatal_error
            .as_deref()
            .is_some_and(|err| err.contains("git clone failed"))
    );
    assert_eq!(outcome.visited, vec![HealNode::Clone]);
    assert_eq!(sandbox.calls(), 0);
}

#[test]
fn local_sandbox_reruns_tests_after_fix() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ProcessSandbox::new(SandboxConfig {
        backend: SandboxBackend::Local,
        timeout_secs: 30,
        test_command: [
            "sh",
            "-c",
            "grep -q 'a + b' calc.py || { echo 'calc.py:2: assert add(2, 3) == 5' >&2; exit 1; }",
        ]
        .map(String::from)
        .to_vec(),
        ..SandboxConfig::default()
    });
    let model = ScriptedModel::new(Some(CLASSIFICATION), Some(FIXED));
    let ci = ScriptedCi::failing();

    let (outcome, _) = heal(&request(&origin.url(), 3), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert_eq!(state.final_status, Some(FinalStatus::Passed));
    assert_eq!(state.iteration, 1);
    assert_eq!(state.commit_count, 1);
    assert_eq!(outcome.test_runs(), 2);
    assert_eq!(model.generate_calls(), 1);
    assert!(checkout(workspace.path()).join(FIXTURE_PATH).is_file());
    let git = Git::new(checkout(workspace.path()));
    assert!(!git.is_tracked(FIXTURE_PATH).expect("ls-files"));
    assert!(git.is_tracked("calc.py").expect("ls-files"));
}

#[test]
fn fixes_stay_index_aligned_with_their_classifications() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    let sandbox = ScriptedSandbox::new(vec![failing_outcome(
        "missing.py:1: NameError: name 'x' is not defined\ncalc.py:2: AssertionError",
    )]);
    // Classification falls back per failure; generation still succeeds.
    let model = ScriptedModel::new(None, Some(FIXED));
    let ci = ScriptedCi::failing();

    let (outcome, _) = heal(&request(&origin.url(), 0), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert_eq!(state.failures.len(), 2);
    assert!(
        state
            .logs
            .iter()
            .any(|line| line.starts_with("[generate] skipped: missing.py does not exist"))
    );
    assert_eq!(state.applied_fixes.len(), 1);
    assert_eq!(state.classified_failures.len(), state.applied_fixes.len());
    for (fix, classification) in state.applied_fixes.iter().zip(&state.classified_failures) {
        assert_eq!(&fix.classification, classification);
    }
    assert_eq!(state.applied_fixes[0].file, "calc.py");
    assert_eq!(state.validation_results.len(), 1);
}

#[test]
fn synthesized_fixture_failures_reach_classification() {
    let origin = origin();
    let workspace = tempfile::tempdir().expect("tempdir");
    // Report every assert in the test suite as a pytest-style failure.
    let report = r#"grep -n 'assert' tests/test_sample.py | sed 's|^\([0-9]*\):.*|tests/test_sample.py:\1: AssertionError|' >&2; exit 1"#;
    let sandbox = ProcessSandbox::new(SandboxConfig {
        backend: SandboxBackend::Local,
        timeout_secs: 30,
        test_command: ["sh", "-c", report].map(String::from).to_vec(),
        ..SandboxConfig::default()
    });
    let model = ScriptedModel::offline();
    let ci = ScriptedCi::failing();

    let (outcome, observed) =
        heal(&request(&origin.url(), 0), workspace.path(), &sandbox, &model, &ci);

    let state = &outcome.state;
    assert!(checkout(workspace.path()).join(FIXTURE_PATH).is_file());
    assert_eq!(state.failures.len(), 2);
    assert!(state.failures.iter().all(|f| f.file == FIXTURE_PATH));
    assert_eq!(
        state.failures.iter().map(|f| f.line).collect::<Vec<_>>(),
        vec![2, 6]
    );
    assert!(observed.contains(&HealNode::ClassifyFailures));
    assert!(
        state
            .logs
            .iter()
            .any(|line| line.starts_with("[classify] UNKNOWN error in tests/test_sample.py line 2"))
    );
    assert_eq!(state.final_status, Some(FinalStatus::Failed));
    assert_eq!(state.commit_count, 0);
}
