use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use super::{Action, ActionContext, ActionSettings};
use crate::core::duration::{format_duration, parse_duration};
use crate::io::process::run_with_timeout;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ExecParams {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    /// Duration string; defaults to the configured action timeout.
    #[serde(default)]
    timeout: Option<String>,
}

/// Run an external command inside the checkout.
#[derive(Debug, Clone)]
pub struct ExecAction {
    command: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ExecAction {
    pub(crate) fn from_params(params: ExecParams, settings: &ActionSettings) -> Result<Self> {
        if params.command.trim().is_empty() {
            bail!("exec: command must not be empty");
        }
        let timeout = match params.timeout.as_deref() {
            Some(raw) => parse_duration(raw)?,
            None => settings.default_timeout,
        };
        if timeout.is_zero() {
            bail!("exec: timeout must be > 0");
        }
        Ok(Self {
            command: resolve_command(&params.command, &settings.task_dir),
            args: params.args,
            timeout,
            output_limit_bytes: settings.output_limit_bytes,
        })
    }
}

/// Paths like `./scripts/fix.sh` are relative to the task file; bare names
/// go through `PATH`.
fn resolve_command(command: &str, task_dir: &Path) -> PathBuf {
    let path = Path::new(command);
    if path.is_relative() && path.components().count() > 1 {
        task_dir.join(path)
    } else {
        path.to_path_buf()
    }
}

impl fmt::Display for ExecAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exec(command={}", self.command.display())?;
        if !self.args.is_empty() {
            write!(f, ", args={}", self.args.join(" "))?;
        }
        f.write_str(")")
    }
}

impl Action for ExecAction {
    #[instrument(skip_all, fields(command = %self.command.display()))]
    fn apply(&self, ctx: &ActionContext<'_>) -> Result<()> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .current_dir(ctx.checkout)
            .env("SWEEPER_REPOSITORY", &ctx.data.repository.full_name)
            .env("SWEEPER_TASK", &ctx.data.task_name);
        let output = run_with_timeout(cmd, self.timeout, self.output_limit_bytes)?;

        if output.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "exec action timed out");
            bail!("command timed out after {}", format_duration(self.timeout));
        }
        if !output.status.success() {
            bail!(
                "command exited with {:?}: stderr '{}' stdout '{}'",
                output.status.code(),
                output.stderr_lossy().trim(),
                output.stdout_lossy().trim()
            );
        }
        debug!("exec action finished");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::template::{TemplateData, Templates};
    use crate::test_support::FakeRepository;
    use std::collections::BTreeMap;
    use std::fs;

    fn settings(task_dir: &Path) -> ActionSettings {
        ActionSettings {
            task_dir: task_dir.to_path_buf(),
            default_timeout: Duration::from_secs(10),
            output_limit_bytes: 4096,
        }
    }

    fn params(command: &str, args: &[&str], timeout: Option<&str>) -> ExecParams {
        ExecParams {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: timeout.map(str::to_string),
        }
    }

    #[test]
    fn runs_in_checkout_with_repository_env() {
        let checkout = tempfile::tempdir().expect("tempdir");
        let repo = FakeRepository::new("github.com/acme/widgets");
        let data = TemplateData::new(&repo, "t", BTreeMap::new());
        let templates = Templates::new();
        let ctx = ActionContext {
            checkout: checkout.path(),
            repository: &repo,
            data: &data,
            templates: &templates,
        };
        let action = ExecAction::from_params(
            params("sh", &["-c", "echo $SWEEPER_REPOSITORY > out.txt"], None),
            &settings(checkout.path()),
        )
        .expect("build");
        action.apply(&ctx).expect("apply");
        let out = fs::read_to_string(checkout.path().join("out.txt")).expect("read");
        assert_eq!(out.trim(), "github.com/acme/widgets");
    }

    #[test]
    fn failure_and_timeout_are_errors() {
        let checkout = tempfile::tempdir().expect("tempdir");
        let repo = FakeRepository::new("github.com/acme/widgets");
        let data = TemplateData::new(&repo, "t", BTreeMap::new());
        let templates = Templates::new();
        let ctx = ActionContext {
            checkout: checkout.path(),
            repository: &repo,
            data: &data,
            templates: &templates,
        };

        let failing = ExecAction::from_params(
            params("sh", &["-c", "echo boom >&2; exit 4"], None),
            &settings(checkout.path()),
        )
        .expect("build");
        let err = failing.apply(&ctx).expect_err("non-zero exit");
        assert!(err.to_string().contains("boom"));

        let slow = ExecAction::from_params(
            params("sh", &["-c", "exec sleep 5"], Some("100ms")),
            &settings(checkout.path()),
        )
        .expect("build");
        let err = slow.apply(&ctx).expect_err("timeout");
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn relative_commands_resolve_against_task_dir() {
        let dir = Path::new("/tasks");
        assert_eq!(
            resolve_command("./scripts/fix.sh", dir),
            PathBuf::from("/tasks/./scripts/fix.sh")
        );
        assert_eq!(resolve_command("sed", dir), PathBuf::from("sed"));
        assert_eq!(resolve_command("/bin/sh", dir), PathBuf::from("/bin/sh"));
    }
}
