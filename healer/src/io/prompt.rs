//! Prompt rendering for the repair model.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::core::classification::{BugKind, target_of};
use crate::core::types::FailureRecord;

const CLASSIFY_SYSTEM: &str = include_str!("prompts/classify_system.md");
const CLASSIFY_USER: &str = include_str!("prompts/classify_user.md");
const FIX_SYSTEM: &str = include_str!("prompts/fix_system.md");
const FIX_USER: &str = include_str!("prompts/fix_user.md");

/// System and user message pair for one chat request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        for (name, source) in [
            ("classify_system", CLASSIFY_SYSTEM),
            ("classify_user", CLASSIFY_USER),
            ("fix_system", FIX_SYSTEM),
            ("fix_user", FIX_USER),
        ] {
            env.add_template(name, source)
                .with_context(|| format!("load prompt template {name}"))?;
        }
        Ok(Self { env })
    }

    pub fn classify(&self, failure: &FailureRecord) -> Result<Prompt> {
        let kinds: Vec<&str> = BugKind::ALL.iter().map(|kind| kind.as_str()).collect();
        let system = self
            .env
            .get_template("classify_system")?
            .render(context! { kinds => kinds })?;
        let user = self.env.get_template("classify_user")?.render(context! {
            file => failure.file,
            line => failure.line,
            message => failure.message.trim(),
        })?;
        Ok(Prompt { system, user })
    }

    pub fn fix(&self, content: &str, classification: &str) -> Result<Prompt> {
        let file = target_of(classification).map(|(file, _)| file);
        let system = self.env.get_template("fix_system")?.render(context! {})?;
        let user = self.env.get_template("fix_user")?.render(context! {
            file => file.as_deref().unwrap_or("unknown"),
            content => content,
            classification => classification.trim(),
        })?;
        Ok(Prompt { system, user })
    }
}
