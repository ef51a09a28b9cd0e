//! Run metadata persisted between runs (`<data_dir>/cache.json`).
//!
//! Drives incremental repository discovery: the next run only asks hosts for
//! repositories changed since the last execution, unless a task changed.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const RUN_STATE_FILE: &str = "cache.json";

/// Checksum of one task as of the last run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskChecksum {
    pub name: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    /// Start of the last non-dry run, in unix microseconds.
    pub last_execution_at: Option<i64>,
    pub tasks: Vec<TaskChecksum>,
}

impl RunState {
    pub fn last_execution(&self) -> Option<DateTime<Utc>> {
        self.last_execution_at
            .and_then(DateTime::<Utc>::from_timestamp_micros)
    }

    /// Cut-off for incremental discovery.
    ///
    /// `None` means "list everything": there was no previous run, or a task
    /// is new or its checksum differs from the recorded one.
    pub fn since(&self, current: &[TaskChecksum]) -> Option<DateTime<Utc>> {
        let last = self.last_execution()?;
        let all_known = current.iter().all(|task| {
            self.tasks
                .iter()
                .any(|known| known.name == task.name && known.checksum == task.checksum)
        });
        if !all_known {
            debug!("task definitions changed, scanning all repositories");
            return None;
        }
        Some(last)
    }
}

/// Load run state; a missing file yields the empty state.
pub fn load_run_state(path: &Path) -> Result<RunState> {
    if !path.exists() {
        debug!(path = %path.display(), "no run state yet");
        return Ok(RunState::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
    let state: RunState = serde_json::from_str(&contents)
        .with_context(|| format!("parse run state {}", path.display()))?;
    debug!(last_execution_at = ?state.last_execution_at, tasks = state.tasks.len(), "run state loaded");
    Ok(state)
}

/// Atomically write run state to disk (temp file + rename).
pub fn write_run_state(path: &Path, state: &RunState) -> Result<()> {
    debug!(path = %path.display(), last_execution_at = ?state.last_execution_at, "writing run state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("run state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp run state {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace run state {}", path.display()))?;
    Ok(())
}
