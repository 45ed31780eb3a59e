//! Bounded retry policy for the healing loop.
//!
//! The policy is a pure function of `(iteration, max_retries)`: the loop
//! reconstructs it from the run state at every decision point, so no policy
//! object outlives a single node invocation.

/// Conclusion string that is eligible for a retry.
pub const RETRYABLE_CONCLUSION: &str = "failure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: 0,
        }
    }

    /// Policy state after `iteration` retries have already been granted.
    pub fn resume(iteration: u32, max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: iteration,
        }
    }

    /// True only for a failure conclusion with budget left.
    pub fn should_retry(&self, conclusion: &str) -> bool {
        conclusion == RETRYABLE_CONCLUSION && self.attempts < self.max_retries
    }

    pub fn track_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn has_exceeded(&self) -> bool {
        self.attempts >= self.max_retries
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

/// Outcome of the retry decision node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Start another pass at this iteration.
    Retry { next_iteration: u32 },
    Exhausted,
}

/// Decide whether a failed iteration gets another pass.
pub fn decide(iteration: u32, max_retries: u32) -> RetryDecision {
    let mut policy = RetryPolicy::resume(iteration, max_retries);
    if policy.should_retry(RETRYABLE_CONCLUSION) {
        policy.track_attempt();
        RetryDecision::Retry {
            next_iteration: policy.attempts(),
        }
    } else {
        RetryDecision::Exhausted
    }
}
