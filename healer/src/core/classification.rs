//! Bug taxonomy and the canonical classification line format.
//!
//! A classification is carried through the loop as a plain string:
//!
//! ```text
//! {KIND} error in {file} line {n} → Fix: {description}
//! ```
//!
//! Unparseable model output is replaced by an `UNKNOWN` line with the same
//! shape so later stages can still locate the target file.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

use crate::core::types::FailureRecord;

/// Kind recorded when the model output could not be parsed.
pub const UNKNOWN_KIND: &str = "UNKNOWN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BugKind {
    Linting,
    Syntax,
    Logic,
    TypeError,
    Import,
    Indentation,
}

impl BugKind {
    pub const ALL: [BugKind; 6] = [
        BugKind::Linting,
        BugKind::Syntax,
        BugKind::Logic,
        BugKind::TypeError,
        BugKind::Import,
        BugKind::Indentation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BugKind::Linting => "LINTING",
            BugKind::Syntax => "SYNTAX",
            BugKind::Logic => "LOGIC",
            BugKind::TypeError => "TYPE_ERROR",
            BugKind::Import => "IMPORT",
            BugKind::Indentation => "INDENTATION",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for BugKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

static STRICT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(LINTING|SYNTAX|LOGIC|TYPE_ERROR|IMPORT|INDENTATION) error in (.+) line (\d+) → Fix: (.+)",
    )
    .expect("classification regex")
});

// Accepts any kind token, including UNKNOWN fallbacks.
static LOOSE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Z_]+) error in (.+) line (\d+) → Fix: (.*)").expect("target regex")
});

/// A parsed, validated classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: BugKind,
    pub file: String,
    pub line: u32,
    pub fix: String,
}

impl Classification {
    /// Parse model output into a classification.
    ///
    /// Only the first line of the trimmed output is considered. The file path
    /// is normalized to lower case.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let caps = STRICT_LINE
            .captures(trimmed)
            .ok_or_else(|| anyhow!("unrecognized classification: {}", first_line(trimmed)))?;
        let kind = BugKind::parse(&caps[1])
            .ok_or_else(|| anyhow!("unknown bug kind {}", &caps[1]))?;
        let line = caps[3]
            .parse::<u32>()
            .map_err(|err| anyhow!("invalid line number {}: {err}", &caps[3]))?;
        Ok(Self {
            kind,
            file: caps[2].trim().to_lowercase(),
            line,
            fix: caps[4].trim().to_string(),
        })
    }

    pub fn render(&self) -> String {
        format!(
            "{} error in {} line {} → Fix: {}",
            self.kind, self.file, self.line, self.fix
        )
    }
}

/// Classification line used when the model output cannot be parsed.
pub fn fallback(failure: &FailureRecord) -> String {
    format!(
        "{UNKNOWN_KIND} error in {} line {} → Fix: manual review required",
        failure.file, failure.line
    )
}

/// Leading kind token of a classification string (`UNKNOWN` if absent).
pub fn kind_of(classification: &str) -> &str {
    classification
        .split_whitespace()
        .next()
        .unwrap_or(UNKNOWN_KIND)
}

/// Target file and line named by any well-shaped classification string.
pub fn target_of(classification: &str) -> Option<(String, u32)> {
    let caps = LOOSE_LINE.captures(classification.trim())?;
    let line = caps[3].parse().ok()?;
    Some((caps[2].trim().to_string(), line))
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_strict_line_and_lowercases_file() {
        let parsed =
            Classification::parse("  LOGIC error in Src/Calc.py line 12 → Fix: return a + b\n")
                .expect("parse");
        assert_eq!(parsed.kind, BugKind::Logic);
        assert_eq!(parsed.file, "src/calc.py");
        assert_eq!(parsed.line, 12);
        assert_eq!(parsed.fix, "return a + b");
        assert_eq!(
            parsed.render(),
            "LOGIC error in src/calc.py line 12 → Fix: return a + b"
        );
    }

    #[test]
    fn ignores_trailing_lines_after_classification() {
        let parsed = Classification::parse(
            "IMPORT error in app.py line 1 → Fix: import os\nExplanation: missing import",
        )
        .expect("parse");
        assert_eq!(parsed.fix, "import os");
    }

    #[test]
    fn rejects_free_form_text() {
        let err = Classification::parse("The test fails because of a typo.").unwrap_err();
        assert!(err.to_string().contains("unrecognized classification"));
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!(Classification::parse("RUNTIME error in a.py line 1 → Fix: x").is_err());
    }

    #[test]
    fn fallback_keeps_location_and_is_targetable() {
        let failure = FailureRecord {
            file: "pkg/mod.py".to_string(),
            line: 4,
            message: "boom".to_string(),
            iteration: 0,
        };
        let line = fallback(&failure);
        assert_eq!(
            line,
            "UNKNOWN error in pkg/mod.py line 4 → Fix: manual review required"
        );
        assert_eq!(kind_of(&line), "UNKNOWN");
        assert_eq!(target_of(&line), Some(("pkg/mod.py".to_string(), 4)));
    }

    #[test]
    fn kind_of_reads_leading_token() {
        assert_eq!(kind_of("SYNTAX error in a.py line 1 → Fix: x"), "SYNTAX");
        assert_eq!(kind_of(""), "UNKNOWN");
    }
}
