//! Git reconciler: keeps a local checkout and a bot-owned task branch in sync.
//!
//! Every operation shells out to the configured `git` executable. Expected
//! control-flow conditions surface as distinguished error types
//! ([`BranchModifiedError`], [`EmptyRepositoryError`]) that callers recover
//! with `anyhow::Error::downcast_ref`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::host::Repository;
use crate::io::config::{GitAuthor, GitUrl, SweeperConfig};
use crate::metrics;

/// Git config key holding the unix time of the last base-branch pull.
pub const LAST_BASE_BRANCH_PULL_KEY: &str = "sweeper.lastBaseBranchPull";

/// A git subprocess exited unsuccessfully.
#[derive(Debug, Clone, Error)]
#[error("git {args} failed: exit code '{exit_code}' stderr '{stderr}' stdout '{stdout}'")]
pub struct GitCommandError {
    pub args: String,
    /// `-1` if the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The task branch carries commits not authored by the bot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("branch contains commits of other authors: {}", .checksums.join(", "))]
pub struct BranchModifiedError {
    pub checksums: Vec<String>,
}

/// The repository has no commits yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("empty repository")]
pub struct EmptyRepositoryError;

/// Operations the processor needs from a git checkout.
///
/// Implemented by [`Git`]; tests substitute scripted clients.
pub trait GitClient {
    /// Clone or refresh the checkout of `repo` and return its path.
    ///
    /// With `retry == false` a failed refresh of an existing checkout deletes
    /// it and clones once more; with `retry == true` the checkout is deleted
    /// up front and no further attempt is made.
    fn prepare(&mut self, repo: &dyn Repository, retry: bool) -> Result<PathBuf>;

    /// True if the working tree has uncommitted changes.
    fn has_local_changes(&self) -> Result<bool>;

    /// True if `origin/<branch>` is missing or differs from the working tree.
    fn has_remote_changes(&self, branch: &str) -> Result<bool>;

    /// Bring the task branch up to date with the base branch.
    ///
    /// Returns whether merging the task branch into the base branch would
    /// conflict. Fails with [`BranchModifiedError`] when foreign commits are
    /// found and `force_rebase` is false.
    fn update_task_branch(
        &mut self,
        branch: &str,
        force_rebase: bool,
        repo: &dyn Repository,
    ) -> Result<bool>;

    /// Stage everything and commit. An empty message uses the default one.
    fn commit_changes(&self, message: &str) -> Result<()>;

    /// Force-push `branch` and set its upstream.
    fn push(&self, branch: &str) -> Result<()>;
}

/// Settings of [`Git`] derived from the bot configuration.
#[derive(Debug, Clone)]
pub struct GitSettings {
    pub data_dir: PathBuf,
    pub git_path: String,
    pub author: Option<GitAuthor>,
    pub clone_options: Vec<String>,
    pub default_commit_message: String,
    pub git_url: GitUrl,
    /// Extra environment for every git process (credential rewrites).
    pub env: Vec<(String, String)>,
}

impl GitSettings {
    pub fn from_config(cfg: &SweeperConfig) -> Result<Self> {
        Ok(Self {
            data_dir: cfg.data_dir.clone(),
            git_path: cfg.git_path.clone(),
            author: cfg.author()?,
            clone_options: cfg.git_clone_options.clone(),
            default_commit_message: cfg.git_commit_message.clone(),
            git_url: cfg.git_url,
            env: cfg.git_env()?,
        })
    }
}

/// [`GitClient`] backed by the `git` executable.
#[derive(Debug, Clone)]
pub struct Git {
    settings: GitSettings,
    checkout_dir: Option<PathBuf>,
    author: Option<GitAuthor>,
}

impl Git {
    pub fn new(settings: GitSettings) -> Self {
        Self {
            settings,
            checkout_dir: None,
            author: None,
        }
    }

    /// Checkout directory of the repository prepared last.
    pub fn checkout_dir(&self) -> Option<&Path> {
        self.checkout_dir.as_deref()
    }

    fn checkout_path(&self, repo: &dyn Repository) -> PathBuf {
        self.settings.data_dir.join("git").join(repo.full_name())
    }

    fn clone_url(&self, repo: &dyn Repository) -> String {
        match self.settings.git_url {
            GitUrl::Https => repo.clone_url_http(),
            GitUrl::Ssh => repo.clone_url_ssh(),
        }
    }

    fn resolve_author(&self, repo: &dyn Repository) -> Option<GitAuthor> {
        if let Some(author) = &self.settings.author {
            return Some(author.clone());
        }
        match repo.host().authenticated_user() {
            Ok(Some(user)) => Some(GitAuthor {
                name: user.name,
                email: user.email,
            }),
            Ok(None) => None,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to discover git author");
                None
            }
        }
    }

    /// Clone into a fresh `checkout`. A failed clone leaves no directory behind.
    fn clone_into(&self, repo: &dyn Repository, checkout: &Path) -> Result<()> {
        if checkout.exists() {
            debug!(dir = %checkout.display(), "removing incomplete checkout");
            fs::remove_dir_all(checkout).with_context(|| {
                format!("remove incomplete checkout directory {}", checkout.display())
            })?;
        }
        fs::create_dir_all(checkout)
            .with_context(|| format!("create git checkout dir {}", checkout.display()))?;
        debug!(dir = %checkout.display(), "cloning repository");
        let url = self.clone_url(repo);
        let mut args = vec!["clone", url.as_str(), "."];
        args.extend(self.settings.clone_options.iter().map(String::as_str));
        if let Err(err) = self.execute(&args) {
            if let Err(remove_err) = fs::remove_dir_all(checkout) {
                warn!(err = %remove_err, dir = %checkout.display(), "failed to remove checkout after failed clone");
            }
            return Err(err).with_context(|| format!("clone repository {}", repo.full_name()));
        }
        Ok(())
    }

    /// Reset the checkout, switch to the base branch and pull if the host
    /// reports changes newer than the last pull.
    fn pull_base_branch(&self, repo: &dyn Repository) -> Result<()> {
        debug!("resetting checkout");
        self.execute(&["reset", "--hard"])
            .context("reset git checkout")?;
        self.execute(&["clean", "-d", "--force"])
            .context("clean git checkout")?;
        let base = repo.base_branch();
        self.execute(&["checkout", &base])
            .with_context(|| format!("checkout base branch {base}"))?;

        let last_pull = self.last_base_branch_pull();
        if last_pull.is_none_or(|at| at < repo.updated_at()) {
            debug!(branch = %base, "pulling base branch");
            self.execute(&["pull", "--prune", "origin", "--ff-only"])
                .context("pull changes from remote into base branch")?;
            let now = Utc::now().timestamp().to_string();
            if let Err(err) = self.execute(&["config", LAST_BASE_BRANCH_PULL_KEY, &now]) {
                warn!(err = %err, "failed to record last base branch pull");
            }
        } else {
            debug!(branch = %base, "base branch up to date, skipping pull");
        }
        Ok(())
    }

    fn last_base_branch_pull(&self) -> Option<DateTime<Utc>> {
        let raw = self.execute(&["config", LAST_BASE_BRANCH_PULL_KEY]).ok()?;
        let secs: i64 = raw.trim().parse().ok()?;
        DateTime::<Utc>::from_timestamp(secs, 0)
    }

    fn branch_exists_local(&self, branch: &str) -> Result<bool> {
        let out = self
            .execute(&["branch", "--format", "%(refname)"])
            .with_context(|| format!("check that branch {branch} exists locally"))?;
        let wanted = format!("refs/heads/{branch}");
        Ok(out.lines().any(|line| line.trim() == wanted))
    }

    fn branch_exists_remote(&self, branch: &str) -> Result<bool> {
        let out = self
            .execute(&["branch", "-r", "--format", "%(refname)"])
            .with_context(|| format!("check that branch {branch} exists in remote"))?;
        let wanted = format!("refs/remotes/origin/{branch}");
        Ok(out.lines().any(|line| line.trim() == wanted))
    }

    /// Attempt a no-commit merge of `branch` into the current branch, then abort it.
    fn has_merge_conflict(&self, branch: &str) -> Result<bool> {
        let detected = match self.execute(&["merge", branch, "--no-ff", "--no-commit"]) {
            Ok(_) => false,
            Err(err) => match err.downcast_ref::<GitCommandError>() {
                // 1 and 2 mean the merge did not succeed.
                Some(git_err) if matches!(git_err.exit_code, 1 | 2) => true,
                _ => {
                    return Err(err)
                        .with_context(|| format!("check for merge conflict of branch {branch}"));
                }
            },
        };

        if let Err(err) = self.execute(&["merge", "--abort"]) {
            // 128: there was no merge to abort.
            let nothing_to_abort = err
                .downcast_ref::<GitCommandError>()
                .is_some_and(|git_err| git_err.exit_code == 128);
            if !nothing_to_abort {
                return Err(err).with_context(|| {
                    format!("abort check for merge conflict of branch {branch}")
                });
            }
        }
        Ok(detected)
    }

    /// Commits between `merge_base` and HEAD whose author is not the bot.
    fn list_foreign_commits(&self, merge_base: &str) -> Result<Vec<String>> {
        let out = self
            .execute(&["rev-list", &format!("{merge_base}..HEAD")])
            .context("list revisions since merge base")?;
        let hashes: Vec<&str> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let Some(author) = &self.author else {
            warn!("no git author configured, cannot detect foreign commits");
            return Ok(Vec::new());
        };

        let mut foreign = Vec::new();
        for hash in hashes {
            let email = self
                .execute(&["show", "--format=%aE", "--no-patch", hash])
                .with_context(|| format!("show author of commit {hash}"))?;
            if email.trim() != author.email {
                foreign.push(hash.to_string());
            }
        }
        Ok(foreign)
    }

    fn execute(&self, args: &[&str]) -> Result<String> {
        let dir = self
            .checkout_dir
            .as_deref()
            .ok_or_else(|| anyhow!("git checkout not prepared"))?;
        self.execute_in(dir, args)
    }

    fn execute_in(&self, dir: &Path, args: &[&str]) -> Result<String> {
        debug!(args = %args.join(" "), dir = %dir.display(), "executing git");
        let mut cmd = Command::new(&self.settings.git_path);
        cmd.args(args).current_dir(dir).env("GIT_TERMINAL_PROMPT", "0");
        // Never fall through to a repository enclosing the data directory.
        if let Some(parent) = dir.parent() {
            cmd.env("GIT_CEILING_DIRECTORIES", parent);
        }
        let started = Instant::now();
        let output = cmd
            .envs(self.settings.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        let subcommand = args.first().copied().unwrap_or_default();
        metrics::record_git_command(subcommand, started.elapsed());
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(GitCommandError {
                args: args.join(" "),
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }
            .into());
        }
        Ok(stdout)
    }
}

/// A directory counts as a checkout only once a clone created its `.git`.
fn is_checkout(dir: &Path) -> bool {
    dir.join(".git").exists()
}

impl GitClient for Git {
    #[instrument(skip_all, fields(repository = %repo.full_name(), retry = retry))]
    fn prepare(&mut self, repo: &dyn Repository, retry: bool) -> Result<PathBuf> {
        let checkout = self.checkout_path(repo);
        self.checkout_dir = Some(checkout.clone());

        let mut recloned = retry;
        if retry && checkout.exists() {
            fs::remove_dir_all(&checkout).with_context(|| {
                format!("remove checkout directory on retry {}", checkout.display())
            })?;
        }

        loop {
            if !is_checkout(&checkout) {
                self.clone_into(repo, &checkout)?;
                break;
            }
            match self.pull_base_branch(repo) {
                Ok(()) => break,
                Err(err) if !recloned => {
                    warn!(err = %format!("{err:#}"), "refreshing checkout failed, cloning again");
                    fs::remove_dir_all(&checkout).with_context(|| {
                        format!("remove checkout directory {}", checkout.display())
                    })?;
                    recloned = true;
                }
                Err(err) => return Err(err),
            }
        }

        self.author = self.resolve_author(repo);
        if let Some(author) = &self.author {
            self.execute(&["config", "user.email", &author.email])
                .context("set git user email")?;
            self.execute(&["config", "user.name", &author.name])
                .context("set git user name")?;
        }

        info!(dir = %checkout.display(), "checkout prepared");
        Ok(checkout)
    }

    fn has_local_changes(&self) -> Result<bool> {
        let out = self
            .execute(&["status", "--porcelain=v1"])
            .context("list local changes in git")?;
        Ok(!out.trim().is_empty())
    }

    fn has_remote_changes(&self, branch: &str) -> Result<bool> {
        if !self.branch_exists_remote(branch)? {
            debug!(branch, "remote branch missing");
            return Ok(true);
        }
        let out = self
            .execute(&["diff", "--name-only", &format!("origin/{branch}")])
            .with_context(|| format!("diff remote branch {branch}"))?;
        Ok(!out.trim().is_empty())
    }

    #[instrument(skip_all, fields(branch = %branch, force_rebase = force_rebase))]
    fn update_task_branch(
        &mut self,
        branch: &str,
        force_rebase: bool,
        repo: &dyn Repository,
    ) -> Result<bool> {
        let base = repo.base_branch();
        if let Err(err) = self.execute(&["checkout", &base]) {
            let empty = err.downcast_ref::<GitCommandError>().is_some_and(|git_err| {
                git_err
                    .stderr
                    .contains("did not match any file(s) known to git")
            });
            if empty {
                return Err(EmptyRepositoryError.into());
            }
            return Err(err).with_context(|| format!("checkout base branch {base}"));
        }

        let exists_local = self.branch_exists_local(branch)?;
        let exists_remote = self.branch_exists_remote(branch)?;
        if !exists_local {
            debug!(branch, exists_remote, "creating task branch");
            if exists_remote {
                self.execute(&["branch", "--track", branch, &format!("origin/{branch}")])
                    .with_context(|| format!("create tracking branch {branch}"))?;
            } else {
                self.execute(&["branch", branch])
                    .with_context(|| format!("create branch {branch}"))?;
            }
        }

        let has_conflict = self.has_merge_conflict(branch)?;

        self.execute(&["checkout", branch])
            .with_context(|| format!("checkout branch {branch}"))?;

        if exists_remote {
            // Rebase onto the remote branch and prefer its side on conflict,
            // so commits pushed by someone else survive.
            debug!(branch, "pulling remote task branch");
            self.execute(&[
                "pull",
                "origin",
                branch,
                "--rebase",
                "--strategy-option",
                "theirs",
            ])
            .with_context(|| format!("pull remote changes into branch {branch}"))?;
        }

        let merge_base = self
            .execute(&["merge-base", &base, branch])
            .with_context(|| format!("find merge base of {base} and {branch}"))?;
        let merge_base = merge_base.trim().to_string();

        if !force_rebase {
            let foreign = self
                .list_foreign_commits(&merge_base)
                .context("detect foreign commits")?;
            if !foreign.is_empty() {
                warn!(branch, count = foreign.len(), "branch contains foreign commits");
                return Err(BranchModifiedError { checksums: foreign }.into());
            }
        }

        debug!(branch, merge_base = %merge_base, "resetting to merge base and rebasing");
        self.execute(&["reset", "--hard", &merge_base])
            .with_context(|| format!("reset branch {branch} to merge base {merge_base}"))?;
        self.execute(&["rebase", &base])
            .with_context(|| format!("rebase branch {branch} onto {base}"))?;

        Ok(has_conflict)
    }

    fn commit_changes(&self, message: &str) -> Result<()> {
        let message = if message.trim().is_empty() {
            self.settings.default_commit_message.as_str()
        } else {
            message
        };
        self.execute(&["add", "."])
            .context("add changes before commit")?;
        self.execute(&["commit", "-m", message])
            .context("commit changes")?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch = %branch))]
    fn push(&self, branch: &str) -> Result<()> {
        self.execute(&["push", "origin", branch, "--set-upstream", "--force"])
            .with_context(|| format!("push to branch {branch}"))?;
        Ok(())
    }
}
