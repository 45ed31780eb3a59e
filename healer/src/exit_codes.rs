//! Stable exit codes for healer CLI commands.

/// Run ended `passed` or `fixed`, or a utility command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments or config, or a fatal error (including a failed clone).
pub const INVALID: i32 = 1;
/// Run ended `failed` after the retry budget was spent.
pub const FAILED: i32 = 2;
