//! Git adapter for the healing loop.
//!
//! All repository mutation goes through `git` subprocess calls in a single
//! working directory, so behavior matches what a developer would see on the
//! command line.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::io::process::TimedCommand;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Author identity passed to git via `-c user.name/-c user.email`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Wrapper for executing git commands in one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    identity: Option<Identity>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Clone `url` into `dest`, or reuse `dest` if it already holds a checkout.
    ///
    /// `branch` selects the branch to check out after cloning.
    #[instrument(skip_all, fields(url, dest = %dest.display(), branch))]
    pub fn clone_or_open(
        url: &str,
        dest: &Path,
        branch: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        if dest.join(".git").is_dir() {
            info!("reusing existing checkout");
            return Ok(Self::new(dest));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        let mut args = vec!["clone".to_string(), "--quiet".to_string()];
        if let Some(branch) = branch {
            args.push("--branch".to_string());
            args.push(branch.to_string());
        }
        args.push(url.to_string());
        args.push(dest.display().to_string());

        let output = TimedCommand::new("git", timeout).args(&args).run()?;
        if output.timed_out {
            bail!("git clone timed out after {}s", timeout.as_secs());
        }
        if !output.success() {
            bail!("git clone failed: {}", output.stderr_text().trim());
        }
        debug!("clone complete");
        Ok(Self::new(dest))
    }

    /// Current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String> {
        Ok(self.run_capture(&["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Status entries including untracked files.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        out.lines()
            .filter(|line| !line.trim().is_empty())
            .map(parse_status_line)
            .collect()
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let status = self
            .run(&["show-ref", "--verify", "--quiet", &reference])?
            .status;
        Ok(status.success())
    }

    /// Create and check out a new branch at HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!("creating branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// Drop `path` from the index if it is staged; the working tree is untouched.
    pub fn unstage(&self, path: &str) -> Result<()> {
        let out = self.run(&["diff", "--cached", "--name-only", "--", path])?;
        if !String::from_utf8_lossy(&out.stdout).trim().is_empty() {
            self.run_checked(&["reset", "--quiet", "--", path])?;
        }
        Ok(())
    }

    /// True when `path` is already known to the index.
    pub fn is_tracked(&self, path: &str) -> Result<bool> {
        let out = self.run(&["ls-files", "--error-unmatch", "--", path])?;
        Ok(out.status.success())
    }

    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit whatever is staged. Callers check for staged changes first.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str) -> Result<()> {
        self.run_checked(&["commit", "--quiet", "-m", message])?;
        Ok(())
    }

    pub fn has_remote(&self, remote: &str) -> Result<bool> {
        let out = self.run_capture(&["remote"])?;
        Ok(out.lines().any(|line| line.trim() == remote))
    }

    /// Push `branch` to `remote`, setting upstream.
    #[instrument(skip_all, fields(remote, branch))]
    pub fn push(&self, remote: &str, branch: &str) -> Result<()> {
        let refspec = format!("{branch}:{branch}");
        self.run_checked(&["push", "--quiet", "--set-upstream", remote, &refspec])?;
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        let mut command = Command::new("git");
        if let Some(identity) = &self.identity {
            command
                .arg("-c")
                .arg(format!("user.name={}", identity.name))
                .arg("-c")
                .arg(format!("user.email={}", identity.email));
        }
        command
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let rest = line[3..].trim();
    let path = match rest.split_once(" -> ") {
        Some((_, renamed)) => renamed.trim(),
        None => rest,
    };
    Ok(StatusEntry {
        code,
        path: path.to_string(),
    })
}
