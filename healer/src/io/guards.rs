//! Branch-safety guard around every mutating git operation.
//!
//! Protection is checked against the live current branch on every call;
//! nothing is cached between invocations.

use std::fmt;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::config::GitConfig;
use crate::io::git::Git;

/// Default prefix prepended to every commit message.
pub const COMMIT_PREFIX: &str = "[AI-AGENT]";

/// A mutating operation targeted a protected branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchProtectionError {
    pub branch: String,
    pub operation: &'static str,
}

impl fmt::Display for BranchProtectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refusing to {} on protected branch '{}'",
            self.operation, self.branch
        )
    }
}

impl std::error::Error for BranchProtectionError {}

/// A commit was requested with a clean working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoChangesError;

impl fmt::Display for NoChangesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("no changes to commit")
    }
}

impl std::error::Error for NoChangesError {}

/// Enforces branch protection for branch creation, commit and push.
#[derive(Debug, Clone)]
pub struct VcsGuard {
    git: Git,
    protected: Vec<String>,
    remote: String,
    commit_prefix: String,
}

impl VcsGuard {
    pub fn new(git: Git, config: &GitConfig) -> Self {
        Self {
            git,
            protected: config.protected_branches.clone(),
            remote: config.remote.clone(),
            commit_prefix: config.commit_prefix.clone(),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected.iter().any(|name| name == branch)
    }

    fn ensure_unprotected(&self, branch: &str, operation: &'static str) -> Result<()> {
        if self.is_protected(branch) {
            warn!(branch, operation, "blocked on protected branch");
            return Err(BranchProtectionError {
                branch: branch.to_string(),
                operation,
            }
            .into());
        }
        Ok(())
    }

    /// Create and check out `name`. Protected names are refused.
    #[instrument(skip_all, fields(branch = name))]
    pub fn create_branch(&self, name: &str) -> Result<()> {
        self.ensure_unprotected(name, "create branch")?;
        if self.git.branch_exists(name)? {
            info!("branch exists, checking out");
            return self.git.checkout_branch(name);
        }
        self.git.checkout_new_branch(name)
    }

    /// Stage everything and commit with the agent prefix.
    ///
    /// Fails with [`BranchProtectionError`] on a protected branch and with
    /// [`NoChangesError`] when the tree is clean.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.commit_excluding(message, &[])
    }

    /// Like [`commit_all`](Self::commit_all), but `excluded` paths are left
    /// out of the commit and stay in the working tree.
    #[instrument(skip_all, fields(excluded = excluded.len()))]
    pub fn commit_excluding(&self, message: &str, excluded: &[&str]) -> Result<String> {
        let branch = self.git.current_branch()?;
        self.ensure_unprotected(&branch, "commit")?;
        if !self.git.is_dirty()? {
            return Err(NoChangesError.into());
        }
        self.git.add_all()?;
        for path in excluded {
            self.git.unstage(path)?;
        }
        if !self.git.has_staged_changes()? {
            return Err(NoChangesError.into());
        }
        let full = prefixed(&self.commit_prefix, message);
        self.git.commit(&full)?;
        info!(branch = %branch, "committed");
        Ok(full)
    }

    /// Push the current branch to the configured remote.
    #[instrument(skip_all)]
    pub fn push_current(&self) -> Result<String> {
        let branch = self.git.current_branch()?;
        self.ensure_unprotected(&branch, "push")?;
        if !self.git.has_remote(&self.remote)? {
            return Err(anyhow!("remote '{}' is not configured", self.remote));
        }
        self.git.push(&self.remote, &branch)?;
        info!(branch = %branch, remote = %self.remote, "pushed");
        Ok(branch)
    }
}

/// `message` with `prefix` prepended, without doubling it.
pub fn prefixed(prefix: &str, message: &str) -> String {
    let message = message.trim();
    if prefix.is_empty() || message.starts_with(prefix) {
        message.to_string()
    } else {
        format!("{prefix} {message}")
    }
}
