//! Healer configuration stored in `healer.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Secrets are never stored here; the config names the environment variables
//! that hold them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default file name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "healer.toml";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealerConfig {
    /// Retries granted after the first failing iteration.
    pub max_retries: u32,

    /// Root for per-run checkouts (`<dir>/<run_id>`) and run records
    /// (`<dir>/runs/<run_id>/result.json`).
    pub workspace_dir: PathBuf,

    pub sandbox: SandboxConfig,
    pub validation: ValidationConfig,
    pub ai: AiConfig,
    pub ci: CiConfig,
    pub git: GitConfig,
}

impl Default for HealerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            workspace_dir: PathBuf::from(".healer"),
            sandbox: SandboxConfig::default(),
            validation: ValidationConfig::default(),
            ai: AiConfig::default(),
            ci: CiConfig::default(),
            git: GitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Run the test command inside a locked-down container.
    Docker,
    /// Run the test command directly in the checkout.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    pub image: String,
    pub memory_limit: String,
    pub pids_limit: u32,
    /// Container network mode; `none` disables networking.
    pub network: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub test_command: Vec<String>,
    /// Write a failing fixture when the repository has no discoverable tests.
    pub synthesize_missing_tests: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image: "healer-test-runner".to_string(),
            memory_limit: "512m".to_string(),
            pids_limit: 256,
            network: "none".to_string(),
            timeout_secs: 300,
            output_limit_bytes: 200_000,
            test_command: ["python", "-m", "pytest", "--tb=short", "-q"]
                .map(String::from)
                .to_vec(),
            synthesize_missing_tests: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Command that reads source on stdin and exits 0 iff it parses.
    /// Empty means the built-in structural check is used.
    pub syntax_command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            syntax_command: [
                "python3",
                "-c",
                "import ast, sys; ast.parse(sys.stdin.read())",
            ]
            .map(String::from)
            .to_vec(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiConfig {
    /// OpenAI-compatible chat completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            model: "meta-llama/llama-3.1-8b-instruct".to_string(),
            api_key_env: "OPENROUTER_API_KEY".to_string(),
            temperature: 0.3,
            max_tokens: 1024,
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CiProviderKind {
    Github,
    /// No external CI; every CI check reports failure.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    pub provider: CiProviderKind,
    pub api_base: String,
    pub token_env: String,
    /// CI checks per iteration before the result counts as failed.
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            provider: CiProviderKind::Github,
            api_base: "https://api.github.com".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            poll_attempts: 3,
            poll_interval_secs: 10,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Branches that may never be created, committed to or pushed.
    pub protected_branches: Vec<String>,
    pub remote: String,
    pub commit_prefix: String,
    pub author_name: String,
    pub author_email: String,
    pub clone_timeout_secs: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            protected_branches: vec!["main".to_string(), "master".to_string()],
            remote: "origin".to_string(),
            commit_prefix: crate::io::guards::COMMIT_PREFIX.to_string(),
            author_name: "healer-bot".to_string(),
            author_email: "healer-bot@users.noreply.github.com".to_string(),
            clone_timeout_secs: 300,
        }
    }
}

impl HealerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workspace_dir.as_os_str().is_empty() {
            return Err(anyhow!("workspace_dir must not be empty"));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err(anyhow!("sandbox.timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.test_command.is_empty() || self.sandbox.test_command[0].trim().is_empty()
        {
            return Err(anyhow!("sandbox.test_command must be a non-empty array"));
        }
        if self.sandbox.backend == SandboxBackend::Docker && self.sandbox.image.trim().is_empty() {
            return Err(anyhow!("sandbox.image is required for the docker backend"));
        }
        if self.validation.timeout_secs == 0 {
            return Err(anyhow!("validation.timeout_secs must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(anyhow!("ai.temperature must be within 0.0..=2.0"));
        }
        if self.ai.timeout_secs == 0 || self.ci.timeout_secs == 0 {
            return Err(anyhow!("ai.timeout_secs and ci.timeout_secs must be > 0"));
        }
        if self.ci.poll_attempts == 0 {
            return Err(anyhow!("ci.poll_attempts must be >= 1"));
        }
        if self.git.remote.trim().is_empty() {
            return Err(anyhow!("git.remote must not be empty"));
        }
        if self.git.commit_prefix.trim().is_empty() {
            return Err(anyhow!("git.commit_prefix must not be empty"));
        }
        if self.git.protected_branches.is_empty()
            || self
                .git
                .protected_branches
                .iter()
                .any(|branch| branch.trim().is_empty())
        {
            return Err(anyhow!(
                "git.protected_branches must list at least one non-empty branch"
            ));
        }
        if self.git.clone_timeout_secs == 0 {
            return Err(anyhow!("git.clone_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file; a missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<HealerConfig> {
    if !path.exists() {
        let cfg = HealerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: HealerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

pub fn write_config(path: &Path, cfg: &HealerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write through a sibling temp file and rename over the target.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path has no file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents).with_context(|| format!("write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
