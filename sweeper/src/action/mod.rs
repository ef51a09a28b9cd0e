//! Actions mutate the files of a prepared checkout.
//!
//! The processor only sequences actions and wraps their errors; built-ins
//! live in the submodules and are constructed from task-file specs by
//! [`build_action`].

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;

use crate::host::Repository;
use crate::io::task_file::{ActionSpec, Params};
use crate::template::{TemplateData, Templates};

mod exec;
mod file;
mod line;

pub use exec::ExecAction;
pub use file::{FileCreateAction, FileDeleteAction};
pub use line::{LineDeleteAction, LineInsertAction, LineReplaceAction};

/// Everything an action may read while it runs.
pub struct ActionContext<'a> {
    /// Root of the checkout; relative action paths resolve against it.
    pub checkout: &'a Path,
    pub repository: &'a dyn Repository,
    pub data: &'a TemplateData,
    pub templates: &'a Templates,
}

impl ActionContext<'_> {
    /// Resolve `relative` inside the checkout, refusing paths that escape it.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        resolve_in(self.checkout, relative)
    }
}

/// A mutation applied to the checked-out files of a repository.
///
/// Actions must be safe to re-run: a failed run is retried from scratch on
/// the next invocation without rollback.
pub trait Action: fmt::Display {
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()>;
}

/// Inputs needed to construct built-in actions.
#[derive(Debug, Clone)]
pub struct ActionSettings {
    /// Directory of the task file; relative `exec` commands resolve against it.
    pub task_dir: PathBuf,
    pub default_timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Construct a built-in action from its task-file spec.
pub fn build_action(spec: &ActionSpec, settings: &ActionSettings) -> Result<Box<dyn Action>> {
    let action: Box<dyn Action> = match spec.action.as_str() {
        "exec" => Box::new(ExecAction::from_params(parse_params(&spec.params)?, settings)?),
        "fileCreate" => Box::new(FileCreateAction::from_params(parse_params(&spec.params)?)?),
        "fileDelete" => Box::new(FileDeleteAction::from_params(parse_params(&spec.params)?)?),
        "lineReplace" => Box::new(LineReplaceAction::from_params(parse_params(&spec.params)?)?),
        "lineDelete" => Box::new(LineDeleteAction::from_params(parse_params(&spec.params)?)?),
        "lineInsert" => Box::new(LineInsertAction::from_params(parse_params(&spec.params)?)?),
        other => bail!("unknown action '{other}'"),
    };
    Ok(action)
}

pub(crate) fn parse_params<T: DeserializeOwned>(params: &Params) -> Result<T> {
    let value = serde_json::to_value(params).context("encode params")?;
    serde_json::from_value(value).context("invalid params")
}

pub(crate) fn resolve_in(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if relative.trim().is_empty() {
        bail!("path must not be empty");
    }
    if rel.components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    }) {
        bail!("path '{relative}' must stay inside the checkout");
    }
    Ok(root.join(rel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::task_file::ActionSpec;

    fn settings() -> ActionSettings {
        ActionSettings {
            task_dir: PathBuf::from("/tasks"),
            default_timeout: Duration::from_secs(5),
            output_limit_bytes: 1024,
        }
    }

    #[test]
    fn builds_known_actions_and_rejects_unknown() {
        let mut spec = ActionSpec {
            action: "fileDelete".to_string(),
            params: Params::new(),
        };
        spec.params
            .insert("path".to_string(), serde_json::json!("README.md"));
        let action = build_action(&spec, &settings()).expect("build");
        assert_eq!(action.to_string(), "fileDelete(path=README.md)");

        spec.action = "teleport".to_string();
        assert!(build_action(&spec, &settings()).is_err());
    }

    #[test]
    fn missing_required_params_fail_at_build_time() {
        let spec = ActionSpec {
            action: "lineReplace".to_string(),
            params: Params::new(),
        };
        assert!(build_action(&spec, &settings()).is_err());
    }

    #[test]
    fn resolve_rejects_escaping_paths() {
        let root = Path::new("/checkout");
        assert_eq!(
            resolve_in(root, "a/b.txt").expect("resolve"),
            PathBuf::from("/checkout/a/b.txt")
        );
        assert!(resolve_in(root, "../etc/passwd").is_err());
        assert!(resolve_in(root, "/etc/passwd").is_err());
        assert!(resolve_in(root, "").is_err());
    }
}
