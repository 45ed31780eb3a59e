//! Isolated test execution.
//!
//! A sandbox never fails the loop: infrastructure problems (missing runtime,
//! timeouts, spawn errors) come back as a failed [`TestOutcome`] with the
//! `error` field set.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::core::types::TestOutcome;
use crate::io::config::{SandboxBackend, SandboxConfig};
use crate::io::process::TimedCommand;

/// Fixture written when a repository has no discoverable tests.
pub const FIXTURE_PATH: &str = "tests/test_sample.py";

const FIXTURE_BODY: &str = r#"def test_sample_failing():
    assert False, "Sample failure - fix this test"


def test_another_failing():
    assert 1 + 1 == 3, "Math error - fix this"
"#;

const DOCKER_KILL_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs a repository's test suite in isolation.
pub trait SandboxRunner {
    fn run_tests(&self, repo: &Path) -> TestOutcome;
}

/// Sandbox backed by a child process, optionally wrapped in a container.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    /// Full argv for one test run in `repo`. `container` names the docker
    /// container so a timed-out run can be killed by name.
    fn argv(&self, repo: &Path, container: &str) -> Vec<String> {
        let cfg = &self.config;
        let mut argv = Vec::new();
        if cfg.backend == SandboxBackend::Docker {
            argv.extend(
                [
                    "docker".to_string(),
                    "run".to_string(),
                    "--rm".to_string(),
                    "--name".to_string(),
                    container.to_string(),
                    "-v".to_string(),
                    format!("{}:/app", repo.display()),
                    "-w".to_string(),
                    "/app".to_string(),
                    "--network".to_string(),
                    cfg.network.clone(),
                    "--memory".to_string(),
                    cfg.memory_limit.clone(),
                    "--pids-limit".to_string(),
                    cfg.pids_limit.to_string(),
                    cfg.image.clone(),
                ],
            );
        }
        argv.extend(cfg.test_command.iter().cloned());
        argv
    }

    fn command(&self, repo: &Path, container: &str) -> Result<TimedCommand> {
        let argv = self.argv(repo, container);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("sandbox test command is empty"))?;
        Ok(
            TimedCommand::new(program, Duration::from_secs(self.config.timeout_secs))
                .args(args)
                .current_dir(repo)
                .capture_limit(self.config.output_limit_bytes),
        )
    }
}

impl SandboxRunner for ProcessSandbox {
    #[instrument(skip_all, fields(repo = %repo.display(), backend = ?self.config.backend))]
    fn run_tests(&self, repo: &Path) -> TestOutcome {
        let repo = match repo.canonicalize() {
            Ok(path) => path,
            Err(err) => {
                return infrastructure_failure(format!(
                    "repository path {} is not accessible: {err}",
                    repo.display()
                ));
            }
        };
        if self.config.synthesize_missing_tests {
            match ensure_test_fixture(&repo) {
                Ok(true) => info!(fixture = FIXTURE_PATH, "no tests found, wrote fixture"),
                Ok(false) => {}
                Err(err) => warn!(err = %err, "failed to write test fixture"),
            }
        }

        let container = container_name();
        let output = match self
            .command(&repo, &container)
            .and_then(TimedCommand::run)
        {
            Ok(output) => output,
            Err(err) => return infrastructure_failure(format!("{err:#}")),
        };
        if output.timed_out && self.config.backend == SandboxBackend::Docker {
            kill_container(&container);
        }
        let error = if output.timed_out {
            Some(format!(
                "Test execution timed out after {}s",
                self.config.timeout_secs
            ))
        } else {
            None
        };
        let outcome = TestOutcome {
            passed: output.success(),
            stdout: with_truncation_note(output.stdout_text(), output.dropped_stdout),
            stderr: with_truncation_note(output.stderr_text(), output.dropped_stderr),
            error,
        };
        debug!(passed = outcome.passed, "tests finished");
        outcome
    }
}

/// Run-scoped container name, `healer-<10 random chars>`.
fn container_name() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(10)
        .collect::<String>()
        .to_lowercase();
    format!("healer-{suffix}")
}

/// Killing the docker client leaves the container running; stop it by name.
fn kill_container(container: &str) {
    let result = TimedCommand::new("docker", DOCKER_KILL_TIMEOUT)
        .args(["kill", container])
        .run();
    match result {
        Ok(output) if output.success() => info!(container, "killed timed-out container"),
        Ok(output) => warn!(
            container,
            stderr = %output.stderr_text().trim(),
            "docker kill failed"
        ),
        Err(err) => warn!(container, err = %err, "docker kill failed"),
    }
}

fn with_truncation_note(mut text: String, dropped: usize) -> String {
    if dropped > 0 {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&format!("[output truncated: {dropped} bytes dropped]\n"));
    }
    text
}

fn infrastructure_failure(error: String) -> TestOutcome {
    warn!(%error, "sandbox infrastructure failure");
    TestOutcome {
        passed: false,
        stdout: String::new(),
        stderr: String::new(),
        error: Some(error),
    }
}

/// True when the repository has a `tests/` directory or top-level `test_*.py`.
pub fn has_discoverable_tests(repo: &Path) -> Result<bool> {
    if repo.join("tests").is_dir() {
        return Ok(true);
    }
    for entry in fs::read_dir(repo).with_context(|| format!("read {}", repo.display()))? {
        let path: PathBuf = entry?.path();
        let is_test_file = path.is_file()
            && path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("test_") && name.ends_with(".py"));
        if is_test_file {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Write [`FIXTURE_PATH`] when no tests are discoverable. Returns whether it
/// wrote the fixture.
pub fn ensure_test_fixture(repo: &Path) -> Result<bool> {
    if has_discoverable_tests(repo)? {
        return Ok(false);
    }
    let path = repo.join(FIXTURE_PATH);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, FIXTURE_BODY).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(command: &[&str]) -> ProcessSandbox {
        ProcessSandbox::new(SandboxConfig {
            backend: SandboxBackend::Local,
            test_command: command.iter().map(|s| s.to_string()).collect(),
            timeout_secs: 10,
            ..SandboxConfig::default()
        })
    }

    #[test]
    fn fixture_written_only_without_tests() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("app.py"), "x = 1\n").expect("write");

        assert!(ensure_test_fixture(temp.path()).expect("fixture"));
        let body = fs::read_to_string(temp.path().join(FIXTURE_PATH)).expect("read");
        assert!(body.contains("def test_sample_failing"));
        assert!(body.contains("def test_another_failing"));

        assert!(!ensure_test_fixture(temp.path()).expect("second call"));
    }

    #[test]
    fn top_level_test_file_counts_as_tests() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("test_app.py"), "def test_x(): pass\n").expect("write");
        assert!(has_discoverable_tests(temp.path()).expect("scan"));
        assert!(!ensure_test_fixture(temp.path()).expect("fixture"));
        assert!(!temp.path().join(FIXTURE_PATH).exists());
    }

    #[test]
    fn local_backend_reports_pass_and_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("tests")).expect("mkdir");

        let passed = local(&["sh", "-c", "echo ok"]).run_tests(temp.path());
        assert!(passed.passed);
        assert_eq!(passed.stdout, "ok\n");

        let failed = local(&["sh", "-c", "echo 'calc.py:2: AssertionError' >&2; exit 1"])
            .run_tests(temp.path());
        assert!(!failed.passed);
        assert!(failed.stderr.contains("calc.py:2"));
        assert!(failed.error.is_none());
    }

    #[test]
    fn capped_output_carries_truncation_note() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("tests")).expect("mkdir");
        let mut sandbox = local(&["sh", "-c", "printf 'abcdefghij'"]);
        sandbox.config.output_limit_bytes = 4;

        let outcome = sandbox.run_tests(temp.path());
        assert_eq!(outcome.stdout, "abcd\n[output truncated: 6 bytes dropped]\n");
    }

    #[test]
    fn timeout_is_reported_as_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("tests")).expect("mkdir");
        let mut sandbox = local(&["sleep", "5"]);
        sandbox.config.timeout_secs = 1;

        let outcome = sandbox.run_tests(temp.path());
        assert!(!outcome.passed);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Test execution timed out after 1s")
        );
    }

    #[test]
    fn timeout_is_enforced_for_shell_wrapped_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("tests")).expect("mkdir");
        let mut sandbox = local(&["sh", "-c", "sleep 6; echo done"]);
        sandbox.config.timeout_secs = 1;

        let started = std::time::Instant::now();
        let outcome = sandbox.run_tests(temp.path());
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!outcome.passed);
        assert!(!outcome.stdout.contains("done"));
        assert_eq!(
            outcome.error.as_deref(),
            Some("Test execution timed out after 1s")
        );
    }

    #[test]
    fn container_names_are_run_scoped() {
        let first = container_name();
        assert!(first.starts_with("healer-"));
        assert_eq!(first.len(), "healer-".len() + 10);
        assert_ne!(first, container_name());
    }

    #[test]
    fn missing_runtime_is_an_infrastructure_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("tests")).expect("mkdir");
        let outcome = local(&["definitely-not-a-test-runner-xyz"]).run_tests(temp.path());
        assert!(!outcome.passed);
        assert!(outcome.error.expect("error").contains("spawn"));
    }

    #[test]
    fn docker_argv_carries_isolation_flags() {
        let sandbox = ProcessSandbox::new(SandboxConfig::default());
        let argv = sandbox.argv(Path::new("/work/repo"), "healer-abc");
        assert_eq!(
            argv,
            [
                "docker",
                "run",
                "--rm",
                "--name",
                "healer-abc",
                "-v",
                "/work/repo:/app",
                "-w",
                "/app",
                "--network",
                "none",
                "--memory",
                "512m",
                "--pids-limit",
                "256",
                "healer-test-runner",
                "python",
                "-m",
                "pytest",
                "--tb=short",
                "-q",
            ]
        );
    }

    #[test]
    fn local_argv_is_the_bare_test_command() {
        let argv = local(&["pytest", "-x"]).argv(Path::new("/work/repo"), "healer-abc");
        assert_eq!(argv, ["pytest", "-x"]);
    }
}
