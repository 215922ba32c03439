//! Stable exit codes for engine CLI commands.

/// Command succeeded; for `run`, every unit completed.
pub const OK: i32 = 0;
/// Invalid input: lex, parse, or graph error (also config/CLI errors).
pub const INVALID: i32 = 1;
/// `engine run` executed the request but at least one unit did not
/// complete.
pub const EXECUTION_FAILED: i32 = 3;
