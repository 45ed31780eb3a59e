//! Test-only fixtures: throwaway git repositories and scripted collaborators.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{FailureRecord, TestOutcome};
use crate::io::ai::RepairModel;
use crate::io::ci::{CiProvider, WorkflowRun};
use crate::io::git::{Git, Identity};
use crate::io::sandbox::SandboxRunner;

fn identity() -> Identity {
    Identity {
        name: "Test Author".to_string(),
        email: "test@example.com".to_string(),
    }
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=Test Author", "-c", "user.email=test@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("spawn git");
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A git repository in a temporary directory.
pub struct TestRepo {
    _dir: TempDir,
    root: PathBuf,
}

impl TestRepo {
    /// Empty repository whose unborn HEAD points at `branch`.
    pub fn new(branch: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().to_path_buf();
        git(&root, &["init", "--quiet"]);
        git(
            &root,
            &["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")],
        );
        Self { _dir: dir, root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn url(&self) -> String {
        self.root.display().to_string()
    }

    pub fn write(&self, relative: &str, contents: &str) {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(path, contents).expect("write file");
    }

    pub fn read(&self, relative: &str) -> String {
        fs::read_to_string(self.root.join(relative)).expect("read file")
    }

    pub fn commit_all(&self, message: &str) {
        git(&self.root, &["add", "-A"]);
        git(&self.root, &["commit", "--quiet", "-m", message]);
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root).with_identity(Some(identity()))
    }

    /// Clone of this repository (with `origin` pointing here) in a new temp dir.
    pub fn clone_into_temp(&self) -> TestRepo {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("clone");
        git(
            dir.path(),
            &["clone", "--quiet", &self.url(), &root.display().to_string()],
        );
        TestRepo { _dir: dir, root }
    }

    pub fn last_commit_message(&self) -> String {
        git(&self.root, &["log", "-1", "--format=%s"])
    }

    pub fn commit_count(&self, reference: &str) -> usize {
        git(&self.root, &["rev-list", "--count", reference])
            .parse()
            .expect("commit count")
    }
}

/// Pops one scripted item per call and repeats the last one forever.
struct Script<T> {
    items: Mutex<VecDeque<T>>,
    calls: AtomicUsize,
}

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        assert!(!items.is_empty(), "script needs at least one entry");
        Self {
            items: Mutex::new(items.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> T {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.lock().expect("script lock");
        if items.len() > 1 {
            items.pop_front().expect("non-empty script")
        } else {
            items.front().cloned().expect("non-empty script")
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn passing_outcome() -> TestOutcome {
    TestOutcome {
        passed: true,
        stdout: "1 passed".to_string(),
        ..TestOutcome::default()
    }
}

pub fn failing_outcome(stderr: &str) -> TestOutcome {
    TestOutcome {
        passed: false,
        stderr: stderr.to_string(),
        ..TestOutcome::default()
    }
}

/// Sandbox returning scripted outcomes.
pub struct ScriptedSandbox {
    script: Script<TestOutcome>,
}

impl ScriptedSandbox {
    pub fn new(outcomes: Vec<TestOutcome>) -> Self {
        Self {
            script: Script::new(outcomes),
        }
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

impl SandboxRunner for ScriptedSandbox {
    fn run_tests(&self, _repo: &Path) -> TestOutcome {
        self.script.next()
    }
}

/// Model with fixed replies; `None` makes the call fail.
pub struct ScriptedModel {
    classification: Option<String>,
    fix: Option<String>,
    generated: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(classification: Option<&str>, fix: Option<&str>) -> Self {
        Self {
            classification: classification.map(str::to_string),
            fix: fix.map(str::to_string),
            generated: AtomicUsize::new(0),
        }
    }

    /// Every call fails, as with a missing API key.
    pub fn offline() -> Self {
        Self::new(None, None)
    }

    pub fn generate_calls(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}

impl RepairModel for ScriptedModel {
    fn classify(&self, _failure: &FailureRecord) -> Result<String> {
        self.classification
            .clone()
            .ok_or_else(|| anyhow!("model offline"))
    }

    fn generate(&self, _content: &str, _classification: &str) -> Result<String> {
        self.generated.fetch_add(1, Ordering::SeqCst);
        self.fix.clone().ok_or_else(|| anyhow!("model offline"))
    }
}

/// CI provider returning scripted runs.
pub struct ScriptedCi {
    script: Script<Option<WorkflowRun>>,
}

impl ScriptedCi {
    pub fn new(runs: Vec<Option<WorkflowRun>>) -> Self {
        Self {
            script: Script::new(runs),
        }
    }

    pub fn concluded(conclusion: &str) -> Self {
        Self::new(vec![Some(WorkflowRun {
            status: "completed".to_string(),
            conclusion: Some(conclusion.to_string()),
        })])
    }

    pub fn passing() -> Self {
        Self::concluded("success")
    }

    pub fn failing() -> Self {
        Self::concluded("failure")
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }
}

impl CiProvider for ScriptedCi {
    fn latest_run(&self) -> Result<Option<WorkflowRun>> {
        Ok(self.script.next())
    }
}
