//! Autonomous CI healing loop.
//!
//! A run clones a repository onto a dedicated branch, executes its tests in a
//! sandbox, asks a model to classify and repair each failure, validates the
//! repairs, commits and pushes them, then watches CI, retrying until the
//! suite is green or the retry budget is spent.
//!
//! - **[`core`]**: Pure logic (graph executor, run state, parsing, scoring).
//!   No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting adapters (git, sandbox, model, CI, config).
//!   Each capability sits behind a trait so tests can script it.
//!
//! [`heal`] wires the two into the canonical pipeline; [`progress`] fans its
//! events out to observers.

pub mod core;
pub mod exit_codes;
pub mod heal;
pub mod io;
pub mod logging;
pub mod progress;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
