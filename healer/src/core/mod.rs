//! Deterministic, pure logic shared by the healing loop.
//!
//! Core modules are free of I/O. They operate on in-memory values and return
//! deterministic outputs suitable for tests.

pub mod branch;
pub mod classification;
pub mod extract;
pub mod graph;
pub mod retry;
pub mod score;
pub mod types;
pub mod validate;
