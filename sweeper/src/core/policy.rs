//! Time and body predicates consulted by the processor.
//!
//! Kept free of I/O so every policy decision can be tested with fixed clocks.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Substring a user produces by ticking the rebase checkbox in a PR body.
///
/// Literal match; must stay in sync with `templates/pull_request_description.md`.
pub const REBASE_CHECKED_MARKER: &str = "[x] If you want to rebase this PR";

/// Identifier of the warning comment posted when a task branch was modified.
pub const BRANCH_MODIFIED_COMMENT_ID: &str = "branch-modified";

/// True if the user asked for a forced rebase through the PR body.
pub fn needs_rebase_by_user(body: &str) -> bool {
    body.contains(REBASE_CHECKED_MARKER)
}

/// Time elapsed since `created_at`, clamped to zero for clock skew.
pub fn age(created_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - created_at).to_std().unwrap_or(Duration::ZERO)
}

/// True once a PR is older than the configured auto-close window.
pub fn auto_close_due(
    auto_close_after: Option<Duration>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    match auto_close_after {
        Some(after) if !after.is_zero() => age(created_at, now) > after,
        _ => false,
    }
}

/// True once a PR is old enough to be merged automatically.
pub fn auto_merge_allowed(
    auto_merge_after: Option<Duration>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    match auto_merge_after {
        Some(after) => age(created_at, now) > after,
        None => true,
    }
}

/// Git state observed after actions ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeState {
    pub has_local_changes: bool,
    pub has_remote_changes: bool,
    pub has_merge_conflict: bool,
}

impl ChangeState {
    /// Whether the task branch has to be pushed.
    pub fn has_changes(self) -> bool {
        (self.has_local_changes && self.has_remote_changes) || self.has_merge_conflict
    }
}

/// Whether a new PR has to be created.
///
/// `base_has_changes` is false when the base branch already contains the
/// task branch. `previous` is `None` when no PR was ever opened.
pub fn should_create(
    base_has_changes: bool,
    has_changes: bool,
    previous: Option<PreviousPr>,
) -> bool {
    match previous {
        None => base_has_changes || has_changes,
        Some(PreviousPr::Open) => false,
        Some(PreviousPr::ClosedOrMerged) => has_changes,
    }
}

/// Coarse state of an existing PR for [`should_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousPr {
    Open,
    ClosedOrMerged,
}
