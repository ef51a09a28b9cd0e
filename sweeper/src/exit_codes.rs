//! Stable exit codes of the `sweeper` CLI.

/// Every pair processed without error, or all task files are valid.
pub const OK: i32 = 0;
/// Invalid config, task files or arguments. Nothing was processed.
pub const INVALID: i32 = 1;
/// The run started but at least one pair or a repository listing failed.
pub const FAILED: i32 = 2;
