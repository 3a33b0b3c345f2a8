//! Stable exit codes for solver CLI commands.

/// Command succeeded; for `solve`, at least one candidate was committed.
pub const OK: i32 = 0;
/// Invalid arguments, config or inputs, or any other error.
pub const INVALID: i32 = 1;
/// `solve` finished without committing any candidate (score 0, preamble only).
pub const NO_COMMIT: i32 = 2;
/// `solve` aborted because a collaborator stopped answering.
pub const UNAVAILABLE: i32 = 3;
