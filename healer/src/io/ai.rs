//! Repair model client.
//!
//! The loop only sees the [`RepairModel`] trait; [`ChatModel`] implements it
//! against any OpenAI-compatible chat completions endpoint.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::FailureRecord;
use crate::io::config::AiConfig;
use crate::io::prompt::{Prompt, PromptEngine};

/// AI capability used by the classify and generate nodes.
pub trait RepairModel {
    /// One classification line for a failure (may be malformed).
    fn classify(&self, failure: &FailureRecord) -> Result<String>;

    /// Full replacement body for a file given its classification.
    fn generate(&self, content: &str, classification: &str) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions backed repair model.
pub struct ChatModel {
    client: Client,
    config: AiConfig,
    api_key: Option<String>,
    prompts: PromptEngine,
}

impl ChatModel {
    /// Build a client; the API key is read from `config.api_key_env`.
    pub fn from_config(config: &AiConfig) -> Result<Self> {
        let api_key = env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "api key not set, model calls will fail");
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            config: config.clone(),
            api_key,
            prompts: PromptEngine::new()?,
        })
    }

    #[instrument(skip_all, fields(model = %self.config.model))]
    fn complete(&self, prompt: &Prompt) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("{} is not set", self.config.api_key_env))?;
        let request = ChatRequest {
            model: &self.config.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &prompt.system,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt.user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .header("X-Title", "healer")
            .json(&request)
            .send()
            .with_context(|| format!("POST {}", self.config.endpoint))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("model endpoint returned {status}: {}", truncate(&body, 300));
        }
        let parsed: ChatResponse = response.json().context("decode chat response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("chat response has no content"))?;
        debug!(chars = content.len(), "model replied");
        Ok(content)
    }
}

impl RepairModel for ChatModel {
    fn classify(&self, failure: &FailureRecord) -> Result<String> {
        let prompt = self.prompts.classify(failure)?;
        self.complete(&prompt)
    }

    fn generate(&self, content: &str, classification: &str) -> Result<String> {
        let prompt = self.prompts.fix(content, classification)?;
        self.complete(&prompt).map(|reply| strip_code_fence(&reply))
    }
}

/// Unwrap a reply fenced in Markdown backticks; other replies pass through.
pub fn strip_code_fence(reply: &str) -> String {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return reply.to_string();
    };
    let Some(body) = rest.strip_suffix("```") else {
        return reply.to_string();
    };
    // Drop the info string (e.g. "python") on the opening fence line.
    let body = match body.split_once('\n') {
        Some((_, body)) => body,
        None => body,
    };
    let mut out = body.trim_end_matches([' ', '\t']).to_string();
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
