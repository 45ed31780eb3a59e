//! Failure extraction from raw test-runner output.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::FailureRecord;

/// Placeholder file used when no structured failure can be found.
pub const UNKNOWN_FILE: &str = "unknown";
/// Maximum characters of raw output kept in the fallback record.
pub const FALLBACK_MESSAGE_CHARS: usize = 500;

// `path:line: message`, one per line. The path may not start with whitespace
// or a colon and may not contain a colon itself.
static LOCATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([^\s:][^:]*?):(\d+):\s*(.+?)\s*$").expect("location regex")
});

/// Turn raw test output into discrete failure records.
///
/// Output that matches no `path:line: message` line still yields exactly one
/// record, so a failing run always produces at least one failure.
pub fn extract_failures(raw: &str, iteration: u32) -> Vec<FailureRecord> {
    let mut seen = HashSet::new();
    let mut failures = Vec::new();
    for line in raw.lines() {
        let Some(caps) = LOCATION_LINE.captures(line) else {
            continue;
        };
        let Ok(line_no) = caps[2].parse::<u32>() else {
            continue;
        };
        let record = FailureRecord {
            file: caps[1].trim().to_string(),
            line: line_no,
            message: caps[3].to_string(),
            iteration,
        };
        if seen.insert((record.file.clone(), record.line, record.message.clone())) {
            failures.push(record);
        }
    }

    if failures.is_empty() {
        failures.push(FailureRecord {
            file: UNKNOWN_FILE.to_string(),
            line: 0,
            message: raw.chars().take(FALLBACK_MESSAGE_CHARS).collect(),
            iteration,
        });
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_pytest_short_traceback_locations() {
        let raw = "\
tests/test_calc.py:7: in test_add
    assert add(1, 2) == 3
calc.py:2: AssertionError
FAILED tests/test_calc.py::test_add - AssertionError
";
        let failures = extract_failures(raw, 1);

        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].file, "tests/test_calc.py");
        assert_eq!(failures[0].line, 7);
        assert_eq!(failures[0].message, "in test_add");
        assert_eq!(failures[1].file, "calc.py");
        assert_eq!(failures[1].line, 2);
        assert_eq!(failures[1].message, "AssertionError");
        assert!(failures.iter().all(|f| f.iteration == 1));
    }

    #[test]
    fn duplicate_triples_are_collapsed() {
        let raw = "a.py:1: boom\na.py:1: boom\na.py:1: other\n";
        let failures = extract_failures(raw, 0);
        assert_eq!(failures.len(), 2);
    }

    #[test]
    fn unstructured_output_yields_single_truncated_record() {
        let raw = "x".repeat(2_000);
        let failures = extract_failures(&raw, 0);

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, UNKNOWN_FILE);
        assert_eq!(failures[0].line, 0);
        assert_eq!(failures[0].message.chars().count(), FALLBACK_MESSAGE_CHARS);
    }

    #[test]
    fn empty_output_still_yields_a_record() {
        let failures = extract_failures("", 3);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].message, "");
        assert_eq!(failures[0].iteration, 3);
    }

    #[test]
    fn fallback_truncation_respects_char_boundaries() {
        let raw = "é".repeat(600);
        let failures = extract_failures(&raw, 0);
        assert_eq!(failures[0].message.chars().count(), FALLBACK_MESSAGE_CHARS);
    }
}
