//! External CI status polling.
//!
//! Providers report the most recent workflow run; [`check_ci`] normalizes
//! that into a [`CiReport`] and swallows every transport or API error.

use std::env;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::core::types::CiReport;
use crate::io::config::{CiConfig, CiProviderKind};

/// Latest workflow run as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkflowRun {
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
}

impl WorkflowRun {
    pub fn report(&self) -> CiReport {
        let completed = self.status == "completed";
        CiReport {
            completed,
            success: completed && self.conclusion.as_deref() == Some("success"),
        }
    }
}

pub trait CiProvider {
    /// Most recent workflow run, or `None` when the repository has none.
    fn latest_run(&self) -> Result<Option<WorkflowRun>>;
}

/// GitHub Actions REST client for one repository.
pub struct GitHubActions {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

impl GitHubActions {
    pub fn for_repo_url(repo_url: &str, config: &CiConfig) -> Result<Self> {
        let (owner, repo) = parse_owner_repo(repo_url)?;
        let token = env::var(&config.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty());
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("healer")
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            owner,
            repo,
            token,
        })
    }

    fn runs_url(&self) -> String {
        format!(
            "{}/repos/{}/{}/actions/runs?per_page=1",
            self.api_base, self.owner, self.repo
        )
    }
}

impl CiProvider for GitHubActions {
    #[instrument(skip_all, fields(owner = %self.owner, repo = %self.repo))]
    fn latest_run(&self) -> Result<Option<WorkflowRun>> {
        let url = self.runs_url();
        let mut request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().with_context(|| format!("GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("GitHub API returned {status} for {url}");
        }
        let page: RunsPage = response.json().context("decode workflow runs")?;
        let run = page.workflow_runs.into_iter().next();
        debug!(found = run.is_some(), "latest workflow run");
        Ok(run)
    }
}

/// Provider used when CI is disabled or unreachable by construction.
pub struct NoCi {
    reason: String,
}

impl NoCi {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl CiProvider for NoCi {
    fn latest_run(&self) -> Result<Option<WorkflowRun>> {
        Err(anyhow!("CI unavailable: {}", self.reason))
    }
}

/// Provider selected by config for `repo_url`. Never fails: construction
/// problems become a [`NoCi`] whose checks report failure.
pub fn provider_for(repo_url: &str, config: &CiConfig) -> Box<dyn CiProvider> {
    match config.provider {
        CiProviderKind::None => Box::new(NoCi::new("disabled in config")),
        CiProviderKind::Github => match GitHubActions::for_repo_url(repo_url, config) {
            Ok(provider) => Box::new(provider),
            Err(err) => {
                warn!(err = %err, "no GitHub Actions provider for repository");
                Box::new(NoCi::new(err.to_string()))
            }
        },
    }
}

/// One CI check. Errors and missing runs map to `{completed: false, success: false}`.
pub fn check_ci(provider: &dyn CiProvider) -> CiReport {
    match provider.latest_run() {
        Ok(Some(run)) => run.report(),
        Ok(None) => CiReport::default(),
        Err(err) => {
            warn!(err = %format!("{err:#}"), "CI check failed");
            CiReport::default()
        }
    }
}

/// Check up to `attempts` times, sleeping `interval` between checks, and stop
/// as soon as a run is completed.
#[instrument(skip_all, fields(attempts))]
pub fn poll_ci(provider: &dyn CiProvider, attempts: u32, interval: Duration) -> CiReport {
    let mut report = CiReport::default();
    for attempt in 1..=attempts.max(1) {
        report = check_ci(provider);
        if report.completed {
            break;
        }
        if attempt < attempts {
            debug!(attempt, "CI not completed, waiting");
            thread::sleep(interval);
        }
    }
    info!(completed = report.completed, success = report.success, "CI status");
    report
}

/// `(owner, repo)` from `https://github.com/o/r(.git)`, `git@github.com:o/r.git`
/// or `o/r`.
pub fn parse_owner_repo(repo_url: &str) -> Result<(String, String)> {
    let trimmed = repo_url.trim().trim_end_matches('/');
    let path = if let Some((_, rest)) = trimmed.split_once("://") {
        let (host, path) = rest
            .split_once('/')
            .ok_or_else(|| anyhow!("repository url has no path: {repo_url}"))?;
        if !host.ends_with("github.com") {
            bail!("not a GitHub repository: {repo_url}");
        }
        path
    } else if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest
    } else if trimmed.starts_with('/') || trimmed.starts_with('.') {
        bail!("local path has no CI provider: {repo_url}");
    } else {
        trimmed
    };
    let path = path.strip_suffix(".git").unwrap_or(path);
    let mut parts = path.split('/').filter(|part| !part.is_empty());
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) => Ok((owner.to_string(), repo.to_string())),
        _ => Err(anyhow!("cannot derive owner/repo from {repo_url}")),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::*;

    struct Queue(RefCell<VecDeque<Result<Option<WorkflowRun>>>>);

    impl Queue {
        fn new(items: Vec<Result<Option<WorkflowRun>>>) -> Self {
            Self(RefCell::new(items.into()))
        }
    }

    impl CiProvider for Queue {
        fn latest_run(&self) -> Result<Option<WorkflowRun>> {
            self.0
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("exhausted")))
        }
    }

    fn run(status: &str, conclusion: Option<&str>) -> WorkflowRun {
        WorkflowRun {
            status: status.to_string(),
            conclusion: conclusion.map(str::to_string),
        }
    }

    #[test]
    fn report_requires_completed_success() {
        assert_eq!(
            run("completed", Some("success")).report(),
            CiReport {
                completed: true,
                success: true
            }
        );
        assert_eq!(
            run("completed", Some("failure")).report(),
            CiReport {
                completed: true,
                success: false
            }
        );
        assert_eq!(run("in_progress", None).report(), CiReport::default());
    }

    #[test]
    fn errors_and_missing_runs_are_not_completed() {
        assert_eq!(check_ci(&NoCi::new("test")), CiReport::default());
        assert_eq!(check_ci(&Queue::new(vec![Ok(None)])), CiReport::default());
    }

    #[test]
    fn poll_stops_at_first_completed_run() {
        let provider = Queue::new(vec![
            Ok(Some(run("queued", None))),
            Err(anyhow!("transient")),
            Ok(Some(run("completed", Some("success")))),
            Ok(Some(run("completed", Some("failure")))),
        ]);
        let report = poll_ci(&provider, 5, Duration::ZERO);
        assert!(report.completed && report.success);
        assert_eq!(provider.0.borrow().len(), 1);
    }

    #[test]
    fn poll_gives_up_after_attempts() {
        let provider = Queue::new(vec![
            Ok(Some(run("queued", None))),
            Ok(Some(run("queued", None))),
            Ok(Some(run("completed", Some("success")))),
        ]);
        let report = poll_ci(&provider, 2, Duration::ZERO);
        assert_eq!(report, CiReport::default());
    }

    #[test]
    fn parses_common_repository_references() {
        let expected = ("octo".to_string(), "calc".to_string());
        assert_eq!(parse_owner_repo("https://github.com/octo/calc").expect("https"), expected);
        assert_eq!(parse_owner_repo("https://github.com/octo/calc.git/").expect("git"), expected);
        assert_eq!(parse_owner_repo("git@github.com:octo/calc.git").expect("ssh"), expected);
        assert_eq!(parse_owner_repo("octo/calc").expect("short"), expected);
    }

    #[test]
    fn rejects_non_github_references() {
        assert!(parse_owner_repo("https://gitlab.com/octo/calc").is_err());
        assert!(parse_owner_repo("/tmp/repo").is_err());
        assert!(parse_owner_repo("https://github.com/octo").is_err());
    }

    #[test]
    fn disabled_provider_reports_failure() {
        let config = CiConfig {
            provider: CiProviderKind::None,
            ..CiConfig::default()
        };
        let provider = provider_for("https://github.com/octo/calc", &config);
        assert_eq!(check_ci(provider.as_ref()), CiReport::default());
    }
}
