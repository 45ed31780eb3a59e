//! Working-branch naming.

use anyhow::{Result, bail};

/// Suffix every working branch carries.
pub const BRANCH_SUFFIX: &str = "AI_FIX";

/// Upper-case, map anything outside `[A-Z0-9]` to `_`, collapse runs of `_`
/// and strip leading/trailing `_`.
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars().flat_map(char::to_uppercase) {
        let mapped = if ch.is_ascii_uppercase() || ch.is_ascii_digit() {
            ch
        } else {
            '_'
        };
        if mapped == '_' && out.ends_with('_') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('_').to_string()
}

/// `{TEAM}_{LEADER}_AI_FIX` from free-form team and leader names.
pub fn generate_branch_name(team_name: &str, leader_name: &str) -> Result<String> {
    let team = sanitize(team_name);
    let leader = sanitize(leader_name);
    if team.is_empty() || leader.is_empty() {
        bail!(
            "team and leader names must contain at least one letter or digit (got {team_name:?}, {leader_name:?})"
        );
    }
    Ok(format!("{team}_{leader}_{BRANCH_SUFFIX}"))
}

/// True when `branch` is exactly the name derived from `team_name` and `leader_name`.
pub fn is_expected_branch(team_name: &str, leader_name: &str, branch: &str) -> bool {
    generate_branch_name(team_name, leader_name)
        .map(|expected| expected == branch)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_and_joins_names() {
        let branch = generate_branch_name("Code Warriors!", "John  Doe").expect("branch");
        assert_eq!(branch, "CODE_WARRIORS_JOHN_DOE_AI_FIX");
    }

    #[test]
    fn strips_edges_and_collapses_separators() {
        let branch = generate_branch_name("--rift__2026--", "a.b").expect("branch");
        assert_eq!(branch, "RIFT_2026_A_B_AI_FIX");
    }

    #[test]
    fn non_ascii_letters_become_separators() {
        let branch = generate_branch_name("Équipe Zéro", "ana").expect("branch");
        assert_eq!(branch, "QUIPE_Z_RO_ANA_AI_FIX");
    }

    #[test]
    fn empty_after_sanitizing_is_rejected() {
        assert!(generate_branch_name("!!!", "leader").is_err());
        assert!(generate_branch_name("team", "").is_err());
    }

    #[test]
    fn expected_branch_check_is_exact() {
        assert!(is_expected_branch("team a", "lead", "TEAM_A_LEAD_AI_FIX"));
        assert!(!is_expected_branch("team a", "lead", "team_a_lead_ai_fix"));
        assert!(!is_expected_branch("!!!", "lead", "_LEAD_AI_FIX"));
    }
}
