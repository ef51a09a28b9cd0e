//! Outcome of processing one (repository, task) pair.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The single result produced for every processed (repository, task) pair.
///
/// Exactly one value is returned per invocation. The orchestrator, the task
/// counters and the CLI output all consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResult {
    /// Processing failed; see the accompanying error.
    Unknown,
    /// Auto-merge is enabled but the PR is younger than `autoMergeAfter`.
    AutoMergeTooEarly,
    /// The task branch carries commits not authored by the bot.
    BranchModified,
    /// Auto-merge is enabled but the PR build did not succeed.
    ChecksFailed,
    /// The host reports the PR as not mergeable.
    Conflict,
    NoChanges,
    PrCreated,
    /// The PR was closed earlier and the task is merge-once.
    PrClosedBefore,
    PrClosed,
    /// The PR was merged earlier and the task is merge-once.
    PrMergedBefore,
    PrMerged,
    PrOpen,
    /// The repository did not pass the task's filters.
    NoMatch,
    /// A cheap policy gate (schedule, limits) skipped the pair.
    Skip,
}

impl ProcessResult {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessResult::Unknown => "unknown",
            ProcessResult::AutoMergeTooEarly => "auto_merge_too_early",
            ProcessResult::BranchModified => "branch_modified",
            ProcessResult::ChecksFailed => "checks_failed",
            ProcessResult::Conflict => "conflict",
            ProcessResult::NoChanges => "no_changes",
            ProcessResult::PrCreated => "pr_created",
            ProcessResult::PrClosedBefore => "pr_closed_before",
            ProcessResult::PrClosed => "pr_closed",
            ProcessResult::PrMergedBefore => "pr_merged_before",
            ProcessResult::PrMerged => "pr_merged",
            ProcessResult::PrOpen => "pr_open",
            ProcessResult::NoMatch => "no_match",
            ProcessResult::Skip => "skip",
        }
    }

    /// Whether this result counts against a task's `maxOpenPRs` budget.
    pub fn counts_as_open_pr(self) -> bool {
        matches!(self, ProcessResult::PrCreated | ProcessResult::PrOpen)
    }

    /// Whether this result counts against a task's `changeLimit` budget.
    pub fn counts_as_change(self) -> bool {
        matches!(self, ProcessResult::PrCreated | ProcessResult::PrMerged)
    }
}

impl fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
