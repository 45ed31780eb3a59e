//! Side-effecting adapters used by the healing loop.

pub mod ai;
pub mod ci;
pub mod config;
pub mod git;
pub mod guards;
pub mod process;
pub mod prompt;
pub mod run_record;
pub mod sandbox;
pub mod syntax;
