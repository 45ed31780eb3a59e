//! Run scoring.

use crate::core::types::FinalStatus;

pub const BASE_SCORE: i64 = 100;
/// Bonus for runs finishing under [`SPEED_BONUS_SECS`].
pub const SPEED_BONUS: i64 = 10;
pub const SPEED_BONUS_SECS: i64 = 300;
/// Commits allowed before each extra commit costs [`COMMIT_PENALTY`].
pub const FREE_COMMITS: i64 = 20;
pub const COMMIT_PENALTY: i64 = 2;

/// Score of a finished run. Failed runs score zero.
pub fn score(status: FinalStatus, elapsed_secs: i64, commits: u32) -> i64 {
    if !status.is_success() {
        return 0;
    }
    let bonus = if elapsed_secs < SPEED_BONUS_SECS {
        SPEED_BONUS
    } else {
        0
    };
    let penalty = COMMIT_PENALTY * (i64::from(commits) - FREE_COMMITS).max(0);
    BASE_SCORE + bonus - penalty
}
