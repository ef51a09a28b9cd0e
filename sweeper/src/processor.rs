//! The repository task processor.
//!
//! [`Processor::process`] decides the outcome of one (repository, task) pair
//! and performs only the side effects that outcome needs. Steps run in a
//! fixed order and every short-circuit is itself a [`ProcessResult`]. In dry
//! run mode every mutating host call and the push are skipped, but the
//! result that would have occurred is still returned.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::action::ActionContext;
use crate::core::duration::format_duration;
use crate::core::policy::{
    BRANCH_MODIFIED_COMMENT_ID, ChangeState, PreviousPr, auto_close_due, auto_merge_allowed,
    needs_rebase_by_user, should_create,
};
use crate::core::result::ProcessResult;
use crate::filter::FilterContext;
use crate::host::{
    PullRequest, PullRequestData, Repository, create_pull_request_comment_with_identifier,
    delete_pull_request_comment_by_identifier,
};
use crate::io::git::{BranchModifiedError, EmptyRepositoryError, GitClient};
use crate::io::locker::RepositoryLock;
use crate::task::Task;
use crate::template::{DescriptionPolicy, TemplateData, Templates};

/// Message used when the base branch already contains every change.
pub const UP_TO_DATE_CLOSE_MESSAGE: &str = "Everything up-to-date. Closing.";

/// Applies tasks to repositories through a [`GitClient`].
pub struct Processor<G: GitClient> {
    data_dir: Option<PathBuf>,
    git: G,
    templates: Templates,
}

impl<G: GitClient> Processor<G> {
    /// `data_dir` holds the lock files; `None` disables locking.
    pub fn new(data_dir: Option<PathBuf>, git: G, templates: Templates) -> Self {
        Self {
            data_dir,
            git,
            templates,
        }
    }

    pub fn git(&self) -> &G {
        &self.git
    }

    /// Process one (repository, task) pair.
    ///
    /// The task's counters are not touched; the caller feeds the result into
    /// [`Task::record_result`].
    #[instrument(skip_all, fields(repository = %repo.full_name(), task = %task.name(), dry_run = dry_run))]
    pub fn process(
        &mut self,
        dry_run: bool,
        repo: &dyn Repository,
        task: &Task,
        do_filter: bool,
    ) -> Result<ProcessResult> {
        debug!("processing repository");
        if !task.is_within_schedule(Utc::now()) {
            debug!("task outside its schedule");
            return Ok(ProcessResult::Skip);
        }
        if task.has_reached_max_open_prs() {
            debug!("max open PRs reached");
            return Ok(ProcessResult::Skip);
        }
        if task.has_reached_change_limit() {
            debug!("change limit reached");
            return Ok(ProcessResult::Skip);
        }

        if do_filter && !matches_filters(repo, task)? {
            return Ok(ProcessResult::NoMatch);
        }

        info!("task matches repository");
        let mut lock = RepositoryLock::acquire(self.data_dir.as_deref(), &repo.full_name())
            .with_context(|| format!("lock repository '{}'", repo.full_name()))?;
        let result = self.process_locked(dry_run, repo, task);
        if let Err(err) = lock.unlock() {
            error!(err = %format!("{err:#}"), "failed to unlock repository");
        }
        result
    }

    fn process_locked(
        &mut self,
        dry_run: bool,
        repo: &dyn Repository,
        task: &Task,
    ) -> Result<ProcessResult> {
        let checkout = self
            .git
            .prepare(repo, false)
            .context("prepare git checkout")?;
        self.apply_task(dry_run, repo, task, &checkout)
            .context("task failed")
    }

    fn apply_task(
        &mut self,
        dry_run: bool,
        repo: &dyn Repository,
        task: &Task,
        checkout: &Path,
    ) -> Result<ProcessResult> {
        let data = task.template_data(repo);
        let branch = task.render_branch_name(&self.templates, &data)?;
        let def = &task.definition;

        let pr = repo
            .find_pull_request(&branch)
            .context("find pull request")?;
        let pr = pr.as_ref();
        let is_open = pr.is_some_and(|pr| repo.is_pull_request_open(pr));

        if let Some(pr) = pr {
            if def.merge_once && repo.is_pull_request_closed(pr) {
                info!(number = pr.number, "pull request was closed before");
                return Ok(ProcessResult::PrClosedBefore);
            }
            if def.merge_once && repo.is_pull_request_merged(pr) {
                info!(number = pr.number, "pull request was merged before");
                return Ok(ProcessResult::PrMergedBefore);
            }
            if def.create_only {
                info!(number = pr.number, "pull request exists and task is create-only");
                return Ok(ProcessResult::PrOpen);
            }
            if is_open
                && auto_close_due(
                    task.auto_close_after(),
                    repo.get_pull_request_creation_time(pr),
                    Utc::now(),
                )
            {
                return self.auto_close(dry_run, repo, task, pr);
            }
        }

        let force_rebase = pr.is_some_and(|pr| needs_rebase_by_user(&repo.get_pull_request_body(pr)));
        if let Some(pr) = pr.filter(|_| force_rebase) {
            debug!("user requested a forced rebase, deleting branch-modified comment");
            if !dry_run {
                delete_pull_request_comment_by_identifier(repo, BRANCH_MODIFIED_COMMENT_ID, pr)?;
            }
        }

        let has_conflict = match self.git.update_task_branch(&branch, force_rebase, repo) {
            Ok(conflict) => conflict,
            Err(err) => return self.handle_branch_error(err, dry_run, repo, pr.filter(|_| is_open)),
        };

        self.apply_actions(repo, task, &data, checkout)?;

        let has_local_changes = self
            .git
            .has_local_changes()
            .context("check for local changes")?;
        if has_local_changes {
            self.git
                .commit_changes(&def.commit_message)
                .context("commit changes")?;
        }

        let base_branch = repo.base_branch();
        let base_lacks_changes = self
            .git
            .has_remote_changes(&base_branch)
            .context("check for remote changes in base branch")?;
        if let Some(pr) = pr.filter(|_| is_open && !base_lacks_changes) {
            info!("closing pull request because base branch contains all changes");
            if !dry_run {
                repo.close_pull_request(UP_TO_DATE_CLOSE_MESSAGE, pr)
                    .context("close pull request")?;
                repo.delete_branch(pr).context("delete branch")?;
            }
            task.on_pr_closed(repo)?;
            return Ok(ProcessResult::PrClosed);
        }

        let has_remote_changes = self
            .git
            .has_remote_changes(&branch)
            .context("check for remote changes")?;
        let state = ChangeState {
            has_local_changes,
            has_remote_changes,
            has_merge_conflict: has_conflict,
        };
        if state.has_changes() {
            debug!(branch, "pushing changes");
            if !dry_run {
                self.git.push(&branch).context("push")?;
            }
        } else {
            info!("no changes after applying actions");
        }

        let pr_data = self.pull_request_data(task, &data)?;

        let previous = pr.map(|_| {
            if is_open {
                PreviousPr::Open
            } else {
                PreviousPr::ClosedOrMerged
            }
        });
        if should_create(base_lacks_changes, state.has_changes(), previous) {
            info!("creating pull request");
            if !dry_run {
                let created = repo
                    .create_pull_request(&branch, &pr_data)
                    .context("create pull request")?;
                info!(number = created.number, url = %created.web_url, "pull request created");
            }
            task.on_pr_created(repo)?;
            return Ok(ProcessResult::PrCreated);
        }

        let Some(pr) = pr.filter(|_| is_open) else {
            return Ok(ProcessResult::NoChanges);
        };

        if def.auto_merge && !state.has_changes() {
            return self.auto_merge(dry_run, repo, task, pr);
        }

        debug!(number = pr.number, "updating pull request");
        if !dry_run {
            repo.update_pull_request(&pr_data, pr)
                .context("update pull request")?;
        }
        Ok(ProcessResult::PrOpen)
    }

    fn auto_close(
        &self,
        dry_run: bool,
        repo: &dyn Repository,
        task: &Task,
        pr: &PullRequest,
    ) -> Result<ProcessResult> {
        let after = task.auto_close_after().unwrap_or_default();
        info!(number = pr.number, "closing pull request automatically");
        if !dry_run {
            let message = format!(
                "Pull request has been open for longer than {}. Closing automatically.",
                format_duration(after)
            );
            repo.close_pull_request(&message, pr)
                .context("close pull request")?;
        }
        task.on_pr_closed(repo)?;
        Ok(ProcessResult::PrClosed)
    }

    fn handle_branch_error(
        &self,
        err: anyhow::Error,
        dry_run: bool,
        repo: &dyn Repository,
        open_pr: Option<&PullRequest>,
    ) -> Result<ProcessResult> {
        if err.downcast_ref::<EmptyRepositoryError>().is_some() {
            info!("repository is empty");
            return Ok(ProcessResult::NoMatch);
        }
        if let (Some(modified), Some(pr)) = (err.downcast_ref::<BranchModifiedError>(), open_pr) {
            warn!(checksums = ?modified.checksums, "branch contains commits of other authors");
            let body = self
                .templates
                .render_branch_modified(&modified.checksums, &repo.base_branch())?;
            if !dry_run {
                create_pull_request_comment_with_identifier(
                    repo,
                    &body,
                    BRANCH_MODIFIED_COMMENT_ID,
                    pr,
                )
                .context("create branch modified comment")?;
            }
            return Ok(ProcessResult::BranchModified);
        }
        Err(err).context("update task branch")
    }

    fn apply_actions(
        &self,
        repo: &dyn Repository,
        task: &Task,
        data: &TemplateData,
        checkout: &Path,
    ) -> Result<()> {
        let ctx = ActionContext {
            checkout,
            repository: repo,
            data,
            templates: &self.templates,
        };
        for action in task.actions() {
            debug!(action = %action, "applying action");
            action
                .apply(&ctx)
                .with_context(|| format!("action {action} failed"))?;
        }
        Ok(())
    }

    fn auto_merge(
        &self,
        dry_run: bool,
        repo: &dyn Repository,
        task: &Task,
        pr: &PullRequest,
    ) -> Result<ProcessResult> {
        let success = repo
            .has_successful_pull_request_build(pr)
            .context("check for successful pull request build")?;
        if !success {
            info!(number = pr.number, "checks of pull request failed");
            return Ok(ProcessResult::ChecksFailed);
        }
        if !auto_merge_allowed(
            task.auto_merge_after(),
            repo.get_pull_request_creation_time(pr),
            Utc::now(),
        ) {
            info!(number = pr.number, "too early to merge pull request");
            return Ok(ProcessResult::AutoMergeTooEarly);
        }
        let can_merge = repo
            .can_merge_pull_request(pr)
            .context("check if pull request can be merged")?;
        if !can_merge {
            warn!(number = pr.number, "cannot merge pull request");
            return Ok(ProcessResult::Conflict);
        }

        info!(number = pr.number, "merging pull request");
        if !dry_run {
            repo.merge_pull_request(!task.definition.keep_branch_after_merge, pr)
                .context("merge pull request")?;
        }
        task.on_pr_merged(repo)?;
        Ok(ProcessResult::PrMerged)
    }

    fn pull_request_data(&self, task: &Task, data: &TemplateData) -> Result<PullRequestData> {
        let def = &task.definition;
        let body = task.render_pr_body(&self.templates, data)?;
        let body = self.templates.render_pull_request_description(
            &body,
            DescriptionPolicy {
                auto_merge: def.auto_merge,
                auto_merge_after: task.auto_merge_after(),
                merge_once: def.merge_once,
            },
        )?;
        Ok(PullRequestData {
            title: task.render_pr_title(&self.templates, data)?,
            body,
            assignees: def.assignees.clone(),
            reviewers: def.reviewers.clone(),
            labels: def.labels.clone(),
            auto_merge: def.auto_merge,
            auto_merge_after: task.auto_merge_after(),
            merge_once: def.merge_once,
            task_name: def.name.clone(),
        })
    }
}

/// All filters must match. A task without filters never matches, so a
/// missing filter list cannot apply a task to every repository.
fn matches_filters(repo: &dyn Repository, task: &Task) -> Result<bool> {
    if task.filters().is_empty() {
        debug!("task has no filters");
        return Ok(false);
    }
    let ctx = FilterContext { repository: repo };
    for filter in task.filters() {
        let matched = filter
            .matches(&ctx)
            .with_context(|| format!("filter {filter} failed"))?;
        if !matched {
            debug!(filter = %filter, "filter does not match");
            return Ok(false);
        }
    }
    Ok(true)
}
