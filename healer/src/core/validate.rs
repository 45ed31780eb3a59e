//! Fix validation rules.
//!
//! Rules are applied in a fixed order and the first failing rule decides the
//! verdict:
//!
//! 1. the fix must change the file,
//! 2. the new content must still parse,
//! 3. the classification kind must belong to the known taxonomy.

use std::fmt;

use crate::core::classification::{BugKind, kind_of};

/// Rendered verdict for a fix that passed every rule.
pub const VALID: &str = "VALID";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid(&'static str),
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Valid => f.write_str(VALID),
            Verdict::Invalid(reason) => write!(f, "INVALID: {reason}"),
        }
    }
}

/// Decides whether source text is syntactically acceptable.
pub trait SyntaxCheck {
    fn parses(&self, source: &str) -> bool;
}

/// Validate one fix against its own classification.
pub fn validate_fix(
    original: &str,
    updated: &str,
    classification: &str,
    syntax: &dyn SyntaxCheck,
) -> Verdict {
    if original == updated {
        return Verdict::Invalid("no changes made");
    }
    if !syntax.parses(updated) {
        return Verdict::Invalid("syntax error introduced");
    }
    if BugKind::parse(kind_of(classification)).is_none() {
        return Verdict::Invalid("mismatch failure");
    }
    Verdict::Valid
}

/// Tokenizer-level check for indentation-structured source.
///
/// Accepts text whose brackets balance, whose string literals terminate and
/// whose block openers (a logical line ending in `:`) are followed by an
/// indented line. Used when no external parser is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuralCheck;

impl SyntaxCheck for StructuralCheck {
    fn parses(&self, source: &str) -> bool {
        structurally_sound(source)
    }
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn structurally_sound(source: &str) -> bool {
    let mut brackets: Vec<char> = Vec::new();
    // Quote character of an open triple-quoted string.
    let mut triple: Option<char> = None;
    // Indent of the statement that opened a block still waiting for a body.
    let mut pending_block: Option<usize> = None;
    let mut statement_indent = 0;

    for line in source.lines() {
        let at_statement_start = triple.is_none() && brackets.is_empty();
        let trimmed = line.trim();
        if at_statement_start {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let indent = indent_width(line);
            if let Some(opener) = pending_block.take() {
                if indent <= opener {
                    return false;
                }
            }
            statement_indent = indent;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut last_code: Option<char> = None;
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if let Some(quote) = triple {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == quote && chars.get(i + 1) == Some(&quote) && chars.get(i + 2) == Some(&quote)
                {
                    triple = None;
                    last_code = Some(quote);
                    i += 3;
                    continue;
                }
                i += 1;
                continue;
            }
            match c {
                '#' => break,
                '\'' | '"' => {
                    if chars.get(i + 1) == Some(&c) && chars.get(i + 2) == Some(&c) {
                        triple = Some(c);
                        i += 3;
                        continue;
                    }
                    let mut j = i + 1;
                    let mut closed = false;
                    while j < chars.len() {
                        if chars[j] == '\\' {
                            j += 2;
                            continue;
                        }
                        if chars[j] == c {
                            closed = true;
                            break;
                        }
                        j += 1;
                    }
                    if !closed {
                        return false;
                    }
                    last_code = Some(c);
                    i = j + 1;
                    continue;
                }
                '(' | '[' | '{' => brackets.push(c),
                ')' | ']' | '}' => {
                    let open = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    if brackets.pop() != Some(open) {
                        return false;
                    }
                }
                _ => {}
            }
            if !c.is_whitespace() {
                last_code = Some(c);
            }
            i += 1;
        }

        if triple.is_none() && brackets.is_empty() && last_code == Some(':') {
            pending_block = Some(statement_indent);
        }
    }

    triple.is_none() && brackets.is_empty() && pending_block.is_none()
}
